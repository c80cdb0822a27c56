//! Interface de linha de comando do benchrun baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// benchrun: despacho concorrente de inferências para benchmarks.
#[derive(Debug, Parser)]
#[command(name = "benchrun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = crate::config::CONFIG_FILE)]
    pub config: PathBuf,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Gera resultados para os casos pendentes.
    Run(RunArgs),

    /// Mostra quantos casos já possuem resultado, por categoria.
    Status(Selection),
}

/// Modelo e categorias sobre os quais um comando atua.
#[derive(Debug, Clone, Args)]
pub struct Selection {
    /// Modelo avaliado (também nomeia o diretório de resultados).
    #[arg(long)]
    pub model: Option<String>,

    /// Categorias a considerar; vazio significa todas do catálogo.
    #[arg(long = "category", value_name = "CATEGORY")]
    pub categories: Vec<String>,

    /// Diretório do catálogo de casos de teste.
    #[arg(long)]
    pub catalogue: Option<PathBuf>,

    /// Diretório raiz dos resultados.
    #[arg(long)]
    pub result_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: Selection,

    /// Número de workers simultâneos.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Arquivo `{categoria: [ids]}` restringindo a execução a esses casos.
    #[arg(long)]
    pub run_ids: Option<PathBuf>,

    /// Lista JSON de ids a ignorar.
    #[arg(long)]
    pub exclude: Option<PathBuf>,

    /// Reexecuta casos que já têm resultado, sobrescrevendo-os.
    #[arg(long, default_value_t = false)]
    pub allow_overwrite: bool,
}
