//! Configuração do benchrun carregada a partir de `benchrun.toml`.
//!
//! A struct [`BenchConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo,
//! e as flags da CLI têm precedência sobre ambos.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::dispatcher::DispatchConfig;
use crate::retry::{BackoffTable, RetryPolicy, default_overload_markers};
use crate::ui::ReporterConfig;
use crate::watchdog::WatchdogConfig;

pub const CONFIG_FILE: &str = "benchrun.toml";

/// Configuração de nível superior carregada de `benchrun.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    /// Número de workers simultâneos.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Diretório onde os resultados são gravados.
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,

    /// Diretório com os arquivos de casos de teste.
    #[serde(default = "default_catalogue_dir")]
    pub catalogue_dir: PathBuf,

    /// Endpoint HTTP do provedor de inferência.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,

    /// Modelo padrão quando `--model` não é informado.
    #[serde(default)]
    pub model: Option<String>,

    /// Pula jobs que já possuem resultado gravado.
    #[serde(default = "default_true")]
    pub resume_mode: bool,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub stall: StallSection,
}

/// Seção `[retry]`: tabela de espera e classificação de falhas.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    /// Espera padrão quando há mais jobs em voo do que degraus na tabela.
    #[serde(default = "default_delay_secs")]
    pub default_delay_secs: u64,

    /// Espera indexada pela quantidade de jobs em voo (1 job → primeiro degrau).
    #[serde(default = "default_backoff_table_secs")]
    pub backoff_table_secs: Vec<u64>,

    /// Espera padrão substituída por categoria.
    #[serde(default)]
    pub category_delay_secs: HashMap<String, u64>,

    /// Frases de sobrecarga tratadas como rate limit.
    #[serde(default = "default_overload_markers")]
    pub overload_markers: Vec<String>,
}

/// Seção `[stall]`: parâmetros do watchdog de travamento.
#[derive(Debug, Clone, Deserialize)]
pub struct StallSection {
    #[serde(default = "default_ten")]
    pub idle_secs: u64,

    #[serde(default = "default_ten")]
    pub interval_secs: u64,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Duração do pulso observável pelas esperas.
    #[serde(default = "default_nudge_millis")]
    pub nudge_millis: u64,

    #[serde(default = "default_poll_millis")]
    pub poll_millis: u64,
}

fn default_pool_size() -> usize {
    1
}

fn default_result_dir() -> PathBuf {
    PathBuf::from("result")
}

fn default_catalogue_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_endpoint() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_true() -> bool {
    true
}

// Valor padrão para a espera: 65s, acima da janela de um minuto dos provedores.
fn default_delay_secs() -> u64 {
    65
}

fn default_backoff_table_secs() -> Vec<u64> {
    vec![5, 10, 15, 20, 35, 45]
}

fn default_ten() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    8
}

fn default_nudge_millis() -> u64 {
    500
}

fn default_poll_millis() -> u64 {
    1000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            default_delay_secs: default_delay_secs(),
            backoff_table_secs: default_backoff_table_secs(),
            category_delay_secs: HashMap::new(),
            overload_markers: default_overload_markers(),
        }
    }
}

impl Default for StallSection {
    fn default() -> Self {
        Self {
            idle_secs: default_ten(),
            interval_secs: default_ten(),
            max_in_flight: default_max_in_flight(),
            nudge_millis: default_nudge_millis(),
            poll_millis: default_poll_millis(),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            result_dir: default_result_dir(),
            catalogue_dir: default_catalogue_dir(),
            endpoint: default_endpoint(),
            api_key: String::new(),
            model: None,
            resume_mode: true,
            retry: RetrySection::default(),
            stall: StallSection::default(),
        }
    }
}

impl BenchConfig {
    /// Carrega a configuração do caminho informado (por padrão `benchrun.toml`).
    /// Usa valores padrão se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<BenchConfig>(&contents)
                .with_context(|| format!("invalid configuration in {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que tornariam o despacho incoerente.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        let table = self.backoff_table();
        if !table.is_monotonic() {
            bail!(
                "retry.backoff_table_secs must be non-decreasing and not exceed retry.default_delay_secs"
            );
        }
        for (category, secs) in &self.retry.category_delay_secs {
            if !table.with_default_delay(Duration::from_secs(*secs)).is_monotonic() {
                bail!(
                    "retry.category_delay_secs.{category} ({secs}s) must not be shorter than the last backoff step"
                );
            }
        }
        if self.stall.interval_secs == 0 || self.stall.poll_millis == 0 {
            bail!("stall.interval_secs and stall.poll_millis must be positive");
        }
        Ok(())
    }

    pub fn backoff_table(&self) -> BackoffTable {
        BackoffTable::from_secs(&self.retry.backoff_table_secs, self.retry.default_delay_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let category_delays = self
            .retry
            .category_delay_secs
            .iter()
            .map(|(category, secs)| (category.clone(), Duration::from_secs(*secs)))
            .collect();
        RetryPolicy::new(self.backoff_table())
            .with_category_delays(category_delays)
            .with_overload_markers(self.retry.overload_markers.clone())
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            idle_threshold: Duration::from_secs(self.stall.idle_secs),
            interval: Duration::from_secs(self.stall.interval_secs),
            max_in_flight: self.stall.max_in_flight,
            poll_interval: Duration::from_millis(self.stall.poll_millis),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            pool_size: self.pool_size,
            nudge_duration: Duration::from_millis(self.stall.nudge_millis),
            watchdog: self.watchdog_config(),
        }
    }

    pub fn reporter_config(&self) -> ReporterConfig {
        ReporterConfig {
            stall_ceiling: self.stall.max_in_flight,
            ..ReporterConfig::default()
        }
    }
}
