pub mod error;
pub mod history;
pub mod marketplace;
pub mod portfolio;
pub mod storage;
pub mod ticker;
