//! Interface de linha de comando do jobplan baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (set-state, run-job,
//! consequences, routes, status) e flags globais (--world, --store,
//! --config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::state_machine::ObjectKey;

/// Arquivo de mundo procurado no diretório atual.
pub const DEFAULT_WORLD_FILE: &str = "world.toml";

/// jobplan: planeja e executa transições de estado de objetos do cluster.
#[derive(Debug, Parser)]
#[command(name = "jobplan", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo TOML com tipos, jobs e objetos.
    #[arg(long, global = true, default_value = DEFAULT_WORLD_FILE)]
    pub world: PathBuf,

    /// Snapshot JSON do store. Tem precedência sobre `store_path` da configuração.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Arquivo de configuração (padrão: jobplan.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Leva objetos aos estados pedidos, ex.: `target/1=mounted`.
    SetState {
        /// Pares `<tipo>/<id>=<estado>`.
        #[arg(required = true, value_parser = parse_assignment)]
        assignments: Vec<(ObjectKey, String)>,

        /// Mensagem do comando.
        #[arg(long, short)]
        message: Option<String>,
    },

    /// Executa um job anunciado.
    RunJob {
        /// Nome da classe do job.
        class: String,

        /// Argumento `<nome>=<valor>`; o valor é lido como JSON quando possível.
        #[arg(long = "arg", value_parser = parse_arg)]
        args: Vec<(String, Value)>,

        /// Objeto alvo `<tipo>/<id>`. Repetido, vira a lista `objects`.
        #[arg(long = "object")]
        objects: Vec<ObjectKey>,

        /// Mensagem do comando.
        #[arg(long, short)]
        message: Option<String>,
    },

    /// Mostra os jobs que uma transição criaria, sem executá-los.
    Consequences {
        object: ObjectKey,
        state: String,
    },

    /// Lista transições e jobs disponíveis para os objetos.
    Routes {
        #[arg(required = true)]
        objects: Vec<ObjectKey>,
    },

    /// Mostra objetos e comandos gravados.
    Status,
}

/// Interpreta `<tipo>/<id>=<estado>`.
fn parse_assignment(s: &str) -> Result<(ObjectKey, String), String> {
    let (object, state) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <kind>/<id>=<state>, got '{s}'"))?;
    if state.is_empty() {
        return Err(format!("missing state in '{s}'"));
    }
    Ok((object.parse()?, state.to_string()))
}

/// Interpreta `<nome>=<valor>`; valores que não são JSON viram strings.
fn parse_arg(s: &str) -> Result<(String, Value), String> {
    let (name, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <name>=<value>, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("missing argument name in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}
