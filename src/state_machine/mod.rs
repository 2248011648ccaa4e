mod command;
mod dependency;
mod job;
mod registry;
mod routes;
mod state;
mod step;

pub use command::{Command, CommandId, CommandStatus};
pub use dependency::{DependOn, Dependable, FixState};
pub use job::{
    Advertisement, Job, JobArgs, JobClass, JobId, JobOutcome, JobSpec, JobState, RetryConfig,
    StateTransition,
};
pub use registry::{Registry, RegistryBuilder};
pub use routes::StateTables;
pub use state::{AttrValue, FieldKind, LookupFn, ObjectKey, ReverseDep, StatefulObject, StatefulType};
pub use step::{
    SENSITIVE_ARG_PREFIX, Step, StepArgs, StepContext, StepOutput, StepPayload, StepResult,
    StepResultState, StepSpec,
};
