//! Configuração do agendador carregada a partir de `jobplan.toml`.
//!
//! A struct [`SchedulerConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `JOBPLAN_STORE` e `JOBPLAN_WORKERS` têm
//! precedência sobre o arquivo.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::JobPlanError;
use crate::state_machine::RetryConfig;

/// Arquivo de configuração procurado no diretório atual.
pub const DEFAULT_CONFIG_FILE: &str = "jobplan.toml";

/// Configuração de nível superior do agendador.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Tamanho do pool geral de execução de steps.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Tamanho do pool de steps marcados como `database`.
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: usize,

    /// Máximo de retentativas de um step idempotente antes de o job falhar.
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Tempo máximo de espera por uma sessão do agente.
    #[serde(default = "default_session_wait_timeout_secs")]
    pub session_wait_timeout_secs: u64,

    /// Tempo máximo de espera pela resposta de uma requisição ao agente.
    #[serde(default = "default_agent_read_timeout_secs")]
    pub agent_read_timeout_secs: u64,

    /// Intervalo de verificação de cancelamento e de reinício de host.
    #[serde(default = "default_cancel_poll_interval_ms")]
    pub cancel_poll_interval_ms: u64,

    /// Por quanto tempo respostas a requisições canceladas são descartadas.
    #[serde(default = "default_cancelled_rpc_ttl_secs")]
    pub cancelled_rpc_ttl_secs: u64,

    /// Capacidade da fila de notificações (descarta as mais antigas).
    #[serde(default = "default_notification_queue_capacity")]
    pub notification_queue_capacity: usize,

    /// Capacidade da fila de envio para os agentes.
    #[serde(default = "default_tx_queue_capacity")]
    pub tx_queue_capacity: usize,

    /// Tamanho máximo de uma requisição serializada.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Tamanho máximo de um lote de envio.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Arquivo de snapshot do store. Sem ele, o estado vive só em memória.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

// Valor padrão para o pool geral: 8.
fn default_worker_pool_size() -> usize {
    8
}

// Valor padrão para o pool de banco de dados: 10.
fn default_db_pool_size() -> usize {
    10
}

// Valor padrão para retentativas de step: 3.
fn default_max_step_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_retry_base_delay_ms() -> u64 {
    1000
}

// Valor padrão para a espera de sessão: 30s.
fn default_session_wait_timeout_secs() -> u64 {
    30
}

// Valor padrão para a leitura do agente: 60s.
fn default_agent_read_timeout_secs() -> u64 {
    60
}

// Valor padrão para o intervalo de verificação: 1000ms.
fn default_cancel_poll_interval_ms() -> u64 {
    1000
}

// Valor padrão para o TTL de requisições canceladas: 600s.
fn default_cancelled_rpc_ttl_secs() -> u64 {
    600
}

// Valor padrão para a fila de notificações: 1024.
fn default_notification_queue_capacity() -> usize {
    1024
}

// Valor padrão para a fila de envio: 256.
fn default_tx_queue_capacity() -> usize {
    256
}

// Valor padrão por requisição: 1 MiB.
fn default_max_request_bytes() -> usize {
    1024 * 1024
}

// Valor padrão por lote: 4 MiB.
fn default_max_batch_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            db_pool_size: default_db_pool_size(),
            max_step_retries: default_max_step_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            session_wait_timeout_secs: default_session_wait_timeout_secs(),
            agent_read_timeout_secs: default_agent_read_timeout_secs(),
            cancel_poll_interval_ms: default_cancel_poll_interval_ms(),
            cancelled_rpc_ttl_secs: default_cancelled_rpc_ttl_secs(),
            notification_queue_capacity: default_notification_queue_capacity(),
            tx_queue_capacity: default_tx_queue_capacity(),
            max_request_bytes: default_max_request_bytes(),
            max_batch_bytes: default_max_batch_bytes(),
            store_path: None,
        }
    }
}

impl SchedulerConfig {
    /// Carrega a configuração de `path`, ou de `jobplan.toml` no diretório
    /// atual. Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self, JobPlanError> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<SchedulerConfig>(&contents)?
        } else {
            Self::default()
        };
        config.with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Variáveis de ambiente têm precedência sobre o arquivo.
    fn with_env_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, JobPlanError> {
        if let Some(store) = var("JOBPLAN_STORE")
            && !store.is_empty()
        {
            self.store_path = Some(PathBuf::from(store));
        }
        if let Some(workers) = var("JOBPLAN_WORKERS")
            && !workers.is_empty()
        {
            self.worker_pool_size = workers
                .parse()
                .map_err(|e| JobPlanError::Config(format!("JOBPLAN_WORKERS={workers}: {e}")))?;
        }
        if self.worker_pool_size == 0 || self.db_pool_size == 0 {
            return Err(JobPlanError::Config("pool sizes must be at least 1".into()));
        }
        Ok(self)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_step_retries,
            base_delay_ms: self.retry_base_delay_ms,
        }
    }
}
