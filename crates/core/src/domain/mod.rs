pub mod analysis;
pub mod baseline;
pub mod coachee;
pub mod experiment;
pub mod run;
pub mod transcript;
