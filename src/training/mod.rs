//! Fine-tuning: optimizer, schedule, loss scaling, and the training loop

pub mod optim;
pub mod scaler;
pub mod scheduler;
pub mod trainer;

pub use optim::{AdamW, AdamWParams};
pub use scaler::{BoundaryOutcome, LossScaler};
pub use scheduler::WarmupCosineSchedule;
pub use trainer::{planned_steps, Phase, TrainConfig, TrainReport, Trainer, TrainerState};
