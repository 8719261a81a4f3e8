pub mod config;
pub mod poller;
pub mod predictions;

pub use config::ReplicateConfig;
pub use poller::{PollSettings, PredictionError, poll_until_terminal, submit_and_await};
pub use predictions::{
    Prediction, PredictionInput, PredictionOutput, PredictionStatus, create_prediction,
    get_prediction,
};
