//! Interface de terminal do benchrun: barra de progresso e linhas de status.
//!
//! Usa `indicatif` para a barra principal e para as linhas dos jobs mais lentos,
//! e `console` para estilização com cores. O [`RunProgress`] apenas lê o
//! [`DispatchState`]; nunca altera o estado do despacho.

use std::sync::Arc;
use std::time::Duration;

use console::Style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::RunSummary;
use crate::state::{DispatchState, InFlightView, StatusSnapshot};

/// Parâmetros de exibição do progresso.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Quantidade de linhas reservadas para os jobs mais lentos.
    pub slots: usize,
    /// Intervalo entre atualizações da tela.
    pub refresh: Duration,
    /// Máximo de jobs em voo para exibir o cronômetro de travamento.
    pub stall_ceiling: usize,
    /// Tempo ocioso a partir do qual o cronômetro aparece.
    pub stall_display_after: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            slots: 5,
            refresh: Duration::from_secs(1),
            stall_ceiling: 8,
            stall_display_after: Duration::from_secs(5),
        }
    }
}

/// Exibição ao vivo de uma execução: barra principal com contadores e uma
/// linha por job lento.
pub struct RunProgress {
    main: ProgressBar,
    lines: Vec<ProgressBar>,
    config: ReporterConfig,
    green: Style,
    red: Style,
}

impl RunProgress {
    /// Cria a exibição em stderr com o rótulo do modelo.
    pub fn new(label: &str, config: ReporterConfig) -> Self {
        Self::with_target(label, config, ProgressDrawTarget::stderr())
    }

    /// Exibição que não desenha nada (testes e modo silencioso).
    pub fn hidden() -> Self {
        Self::with_target("", ReporterConfig::default(), ProgressDrawTarget::hidden())
    }

    fn with_target(label: &str, config: ReporterConfig, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let main = multi.add(ProgressBar::new(0));
        main.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        main.set_prefix(format!("Generating results for {label}"));

        let line_style =
            ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner());
        let lines = (0..config.slots)
            .map(|_| {
                let line = multi.add(ProgressBar::new(0));
                line.set_style(line_style.clone());
                line
            })
            .collect();

        Self {
            main,
            lines,
            config,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    /// Inicia a atualização periódica a partir do estado compartilhado.
    pub fn spawn(self, state: Arc<DispatchState>) -> ProgressHandle {
        let (stop, mut stopped) = oneshot::channel::<bool>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.refresh);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let completed = loop {
                tokio::select! {
                    _ = ticker.tick() => self.render(&state.snapshot()),
                    done = &mut stopped => break done.unwrap_or(false),
                }
            };
            self.render(&state.snapshot());
            self.close(completed);
        });
        ProgressHandle { stop, task }
    }

    fn render(&self, snapshot: &StatusSnapshot) {
        self.main.set_length(snapshot.total as u64);
        self.main.set_position(snapshot.completed as u64);
        self.main.set_message(counters_message(snapshot, &self.config));
        for (line, text) in self.lines.iter().zip(status_lines(snapshot, self.config.slots)) {
            line.set_message(text);
        }
    }

    fn close(&self, completed: bool) {
        for line in &self.lines {
            line.finish_and_clear();
        }
        if completed {
            self.main
                .finish_with_message(format!("{} done", self.green.apply_to("✓")));
        } else {
            self.main
                .abandon_with_message(format!("{} aborted", self.red.apply_to("✗")));
        }
    }
}

/// Controle da tarefa de exibição em execução.
pub struct ProgressHandle {
    stop: oneshot::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProgressHandle {
    /// Desenha o quadro final e encerra a barra como concluída.
    pub async fn finish(self) {
        self.stop_with(true).await;
    }

    /// Encerra a barra marcando a execução como abortada.
    pub async fn abandon(self) {
        self.stop_with(false).await;
    }

    async fn stop_with(self, completed: bool) {
        let _ = self.stop.send(completed);
        let _ = self.task.await;
    }
}

/// Contadores da barra principal: filtrados por conteúdo, rate limits e,
/// perto do fim da execução, o tempo desde a última conclusão.
pub fn counters_message(snapshot: &StatusSnapshot, config: &ReporterConfig) -> String {
    let mut message = format!(
        "CF: {} RL: {}",
        snapshot.content_filtered, snapshot.rate_limited
    );
    let tail = (1..=config.stall_ceiling).contains(&snapshot.in_flight);
    if tail && snapshot.idle > config.stall_display_after {
        message.push_str(&format!(" ⚡STL: {}s", snapshot.idle.as_secs()));
    }
    message
}

/// Uma linha por slot; slots sem job ficam vazios.
pub fn status_lines(snapshot: &StatusSnapshot, slots: usize) -> Vec<String> {
    (0..slots)
        .map(|i| snapshot.running.get(i).map(status_line).unwrap_or_default())
        .collect()
}

/// Descreve um job em execução: marcador, tempo decorrido, retentativas,
/// tempo desde a última retentativa e desde o último empurrão do watchdog.
pub fn status_line(view: &InFlightView) -> String {
    let recently_nudged = view
        .since_nudge
        .is_some_and(|d| d < Duration::from_secs(10));
    let marker = if recently_nudged {
        "🔔"
    } else if view.elapsed > Duration::from_secs(120) {
        "⏰"
    } else if view.elapsed > Duration::from_secs(60) {
        "⏳"
    } else {
        "⏱"
    };

    let mut line = format!("{marker} {}: {}s", view.id, view.elapsed.as_secs());
    if view.rate_limit_retries > 0 {
        line.push_str(&format!(" [RL:{}]", view.rate_limit_retries));
    }
    if let Some(since) = view.since_retry {
        line.push_str(&format!(" [LR:{}s]", since.as_secs()));
    }
    if let Some(since) = view.since_nudge {
        line.push_str(&format!(" [LP:{}s]", since.as_secs()));
    }
    line
}

/// Imprime o resumo final da execução em JSON com cabeçalho colorido.
pub fn print_summary(summary: &RunSummary) {
    let style = if summary.failed == 0 {
        Style::new().green().bold()
    } else {
        Style::new().yellow().bold()
    };
    println!();
    println!("{}", style.apply_to("─── Run Summary ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(summary).unwrap_or_default()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: &str, elapsed: u64) -> InFlightView {
        InFlightView {
            id: id.into(),
            elapsed: Duration::from_secs(elapsed),
            rate_limit_retries: 0,
            since_retry: None,
            since_nudge: None,
        }
    }

    fn snapshot(in_flight: usize, idle: u64, running: Vec<InFlightView>) -> StatusSnapshot {
        StatusSnapshot {
            total: 10,
            completed: 10 - in_flight,
            in_flight,
            rate_limited: 4,
            content_filtered: 1,
            idle: Duration::from_secs(idle),
            running,
        }
    }

    #[test]
    fn plain_line_for_fresh_job() {
        assert_eq!(status_line(&view("simple_3", 12)), "⏱ simple_3: 12s");
    }

    #[test]
    fn markers_follow_elapsed_time_and_nudges() {
        assert!(status_line(&view("a_1", 61)).starts_with("⏳"));
        assert!(status_line(&view("a_1", 121)).starts_with("⏰"));

        let mut nudged = view("a_1", 200);
        nudged.since_nudge = Some(Duration::from_secs(3));
        assert!(status_line(&nudged).starts_with("🔔"));
        nudged.since_nudge = Some(Duration::from_secs(30));
        assert!(status_line(&nudged).starts_with("⏰"));
    }

    #[test]
    fn annotations_for_retries_and_nudges() {
        let mut v = view("multiple_7", 95);
        v.rate_limit_retries = 3;
        v.since_retry = Some(Duration::from_secs(14));
        v.since_nudge = Some(Duration::from_secs(40));
        assert_eq!(
            status_line(&v),
            "⏳ multiple_7: 95s [RL:3] [LR:14s] [LP:40s]"
        );
    }

    #[test]
    fn fewer_jobs_than_slots_leaves_blank_lines() {
        let snap = snapshot(2, 0, vec![view("a_1", 9), view("a_2", 3)]);
        let lines = status_lines(&snap, 5);
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("a_1"));
        assert!(lines[2..].iter().all(String::is_empty));
        assert!(status_lines(&snapshot(0, 0, Vec::new()), 0).is_empty());
    }

    #[test]
    fn stall_timer_only_in_idle_tail() {
        let config = ReporterConfig::default();
        assert_eq!(counters_message(&snapshot(3, 4, Vec::new()), &config), "CF: 1 RL: 4");
        assert_eq!(
            counters_message(&snapshot(3, 17, Vec::new()), &config),
            "CF: 1 RL: 4 ⚡STL: 17s"
        );
        assert_eq!(counters_message(&snapshot(9, 17, Vec::new()), &config), "CF: 1 RL: 4");
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_progress_runs_and_stops() {
        let state = Arc::new(DispatchState::new(Duration::from_millis(500)));
        state.admit("simple_1");
        let handle = RunProgress::hidden().spawn(Arc::clone(&state));
        tokio::time::sleep(Duration::from_secs(3)).await;
        state.finish("simple_1", None);
        handle.finish().await;
        assert_eq!(state.in_flight(), 0);
    }
}
