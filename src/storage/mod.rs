//! 存储层：原子写入、指标存储、阶段断点、Library / Book / Stage 分层目录

pub mod atomic;
pub mod checkpoint;
pub mod library;
pub mod metrics;

pub use checkpoint::{CheckpointTracker, Progress, StageState, StageStatus, UnitId, UnitValidator};
pub use library::{page_file_name, Book, Library, Stage};
pub use metrics::{MetricRecord, MetricUpdate, MetricsStore, MetricsSummary};
