pub mod backup;
pub mod clock;
pub mod confirm;
pub mod context;
pub mod copy;
pub mod cronjob;
pub mod inspect;
pub mod labels;
pub mod migrate;
pub mod resources;
pub mod revision;
pub mod shadow;
pub mod wait;

pub use context::Context;
pub use migrate::{relabel_deployment, MigrationError, RelabelOutcome};
