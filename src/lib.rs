pub mod checkpoint;
pub mod data;
pub mod error;
pub mod model;
pub mod optim;
pub mod prefetch;
pub mod summary;
pub mod training;
pub mod utils;
