//! 批处理流水线：线程池逐单元处理 Stage，并串起落盘、指标与检查点

pub mod batch;

pub use batch::{BatchReport, BatchRunner, UnitFailure, UnitOutput};
