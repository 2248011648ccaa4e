//! Interface de terminal do jobplan: spinner e saída colorida.
//!
//! Usa `indicatif` para o spinner enquanto um comando roda e `console`
//! para colorir o resumo dos jobs. O [`CommandProgress`] acompanha um
//! comando do agendamento até a conclusão.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::state_machine::{Command, CommandStatus, Job, StatefulObject};

/// Uma linha do resumo: o job, sua descrição e o backtrace da falha, se houver.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job: Job,
    pub description: String,
    pub failure: Option<String>,
}

/// Indicador visual de progresso de um comando no terminal.
///
/// Exibe um spinner enquanto os jobs rodam e, ao final, o status do
/// comando em verde (sucesso), vermelho (erro) ou amarelo (cancelado).
pub struct CommandProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl CommandProgress {
    /// Inicia o spinner com a mensagem do comando.
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza o spinner com quantos jobs já terminaram.
    pub fn update(&self, message: &str, done: usize, total: usize) {
        self.pb.set_message(format!("{message} [{done}/{total}]"));
    }

    /// Finaliza o spinner e imprime o status do comando e de cada job.
    pub fn finish(&self, command: &Command, jobs: &[JobSummary]) {
        self.pb.finish_and_clear();
        let (mark, style) = match command.status() {
            CommandStatus::Successful => ("✓", &self.green),
            CommandStatus::Errored => ("✗", &self.red),
            CommandStatus::Cancelled => ("⊘", &self.yellow),
            CommandStatus::Running => ("…", &self.dim),
        };
        println!(
            "{} Command {} \"{}\": {}",
            style.apply_to(mark),
            command.id,
            command.message,
            style.apply_to(command.status())
        );
        if jobs.is_empty() {
            println!("  {}", self.dim.apply_to("nothing to do"));
        }
        for line in jobs {
            self.print_job(line);
        }
    }

    fn print_job(&self, line: &JobSummary) {
        let job = &line.job;
        let mark = if job.succeeded() {
            self.green.apply_to("✓")
        } else if job.errored {
            self.red.apply_to("✗")
        } else if job.cancelled {
            self.yellow.apply_to("⊘")
        } else {
            self.dim.apply_to("·")
        };
        println!("  {mark} #{} {}", job.id, line.description);
        // Só a primeira linha do backtrace remoto.
        if let Some(first) = line.failure.as_deref().and_then(|f| f.lines().next()) {
            println!("      {}", self.red.apply_to(first));
        }
    }
}

/// Imprime objetos e comandos gravados no store.
pub fn print_status(objects: &[StatefulObject], commands: &[Command]) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    println!("{}", bold.apply_to("Objects"));
    if objects.is_empty() {
        println!("  {}", dim.apply_to("none"));
    }
    for object in objects {
        let marker = if object.immutable_state { " (observed)" } else { "" };
        println!("  {:<20} {}{}", object.key.to_string(), object.state, dim.apply_to(marker));
    }

    println!("{}", bold.apply_to("Commands"));
    if commands.is_empty() {
        println!("  {}", dim.apply_to("none"));
    }
    for command in commands {
        println!(
            "  #{:<4} {:<10} {} {}",
            command.id,
            command.status().to_string(),
            command.message,
            dim.apply_to(format!("({} jobs)", command.jobs.len()))
        );
    }
}

/// Imprime um valor em JSON formatado sob um título.
pub fn print_json<T: Serialize>(title: &str, value: &T) {
    println!("{}", Style::new().cyan().bold().apply_to(format!("─── {title} ───")));
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}
