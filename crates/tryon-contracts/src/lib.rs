pub mod events;
pub mod jobs;
pub mod outcome;
pub mod providers;
pub mod request;
pub mod runs;
