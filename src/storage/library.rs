//! 分层存储：Library → Book → Stage
//!
//! 锁顺序固定为 Library → Book → Stage：只有 Library::book 与 Book::stage 这两个访问器
//! 会在持有上层锁时构造下层对象，其它代码不做嵌套加锁。
//!
//! 目录布局：
//! ```text
//! <root>/<book>/metadata.json
//! <root>/<book>/<stage>/page_0001.json
//! <root>/<book>/<stage>/metrics.json
//! <root>/<book>/<stage>/.checkpoint
//! <root>/<book>/<stage>/logs/
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::{ConfigError, StorageError};
use crate::storage::{atomic, CheckpointTracker, MetricsStore, UnitId};

const METRICS_FILE: &str = "metrics.json";
const CHECKPOINT_FILE: &str = ".checkpoint";
const BOOK_METADATA_FILE: &str = "metadata.json";
const LOG_DIR: &str = "logs";

/// 页面输出文件名：page_0001.json
pub fn page_file_name(unit: UnitId) -> String {
    format!("page_{unit:04}.json")
}

fn parse_page_file_name(name: &str) -> Option<UnitId> {
    name.strip_prefix("page_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Book id / Stage 名 / 命名文件只能是单个路径分量，不能跳出所在目录
fn validate_name(name: &str) -> Result<(), StorageError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).is_absolute();
    if bad {
        return Err(StorageError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 存储根：持有全部 Book 句柄
#[derive(Debug)]
pub struct Library {
    root: PathBuf,
    books: Mutex<HashMap<String, Arc<Book>>>,
}

impl Library {
    /// 打开存储根目录；无法创建或不是目录时为启动期致命错误
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|source| ConfigError::StorageRoot {
            path: root.clone(),
            source,
        })?;
        std::fs::read_dir(&root).map_err(|source| ConfigError::StorageRoot {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            books: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 获取（或创建）Book 句柄；同一 id 始终返回同一个 Arc
    pub fn book(&self, id: &str) -> Result<Arc<Book>, StorageError> {
        validate_name(id)?;
        let mut books = lock(&self.books);
        if let Some(book) = books.get(id) {
            return Ok(Arc::clone(book));
        }
        let book = Arc::new(Book::open(self.root.join(id), id)?);
        books.insert(id.to_string(), Arc::clone(&book));
        Ok(book)
    }

    /// 便捷访问：先取 Book 再取 Stage（两层锁依次获取、依次释放）
    pub fn stage(&self, book_id: &str, stage: &str) -> Result<Arc<Stage>, StorageError> {
        self.book(book_id)?.stage(stage)
    }

    /// 磁盘上已有的 Book 目录名（排序）
    pub fn list_books(&self) -> Result<Vec<String>, StorageError> {
        list_subdirs(&self.root)
    }
}

/// 一本书：持有其 Stage 句柄与元数据
#[derive(Debug)]
pub struct Book {
    id: String,
    dir: PathBuf,
    stages: Mutex<HashMap<String, Arc<Stage>>>,
}

impl Book {
    fn open(dir: PathBuf, id: &str) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(Self {
            id: id.to_string(),
            dir,
            stages: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 获取（或创建）Stage 句柄；Stage 的指标与断点在 Book 锁内加载，保证同名 Stage 只有一份
    pub fn stage(&self, name: &str) -> Result<Arc<Stage>, StorageError> {
        validate_name(name)?;
        let mut stages = lock(&self.stages);
        if let Some(stage) = stages.get(name) {
            return Ok(Arc::clone(stage));
        }
        let stage = Arc::new(Stage::open(self.dir.join(name), &self.id, name)?);
        stages.insert(name.to_string(), Arc::clone(&stage));
        Ok(stage)
    }

    pub fn list_stages(&self) -> Result<Vec<String>, StorageError> {
        list_subdirs(&self.dir)
    }

    /// 读取 metadata.json；文件不存在返回空 Map
    pub fn metadata(&self) -> Result<Map<String, Value>, StorageError> {
        let path = self.dir.join(BOOK_METADATA_FILE);
        Ok(read_json::<Map<String, Value>>(&path)?.unwrap_or_default())
    }

    pub fn save_metadata(&self, metadata: &Map<String, Value>) -> Result<(), StorageError> {
        atomic::write_json(self.dir.join(BOOK_METADATA_FILE), metadata)
    }
}

/// 流水线阶段：独占一个 MetricsStore 与一个 CheckpointTracker
#[derive(Debug)]
pub struct Stage {
    name: String,
    dir: PathBuf,
    metrics: Arc<MetricsStore>,
    checkpoint: Arc<CheckpointTracker>,
}

impl Stage {
    fn open(dir: PathBuf, book_id: &str, name: &str) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let metrics = Arc::new(MetricsStore::open(dir.join(METRICS_FILE)));
        let checkpoint = Arc::new(CheckpointTracker::open(
            dir.join(CHECKPOINT_FILE),
            book_id,
            name,
        ));

        // 默认续跑校验：页面文件存在且是合法 JSON
        let page_dir = dir.clone();
        checkpoint.set_validator(Arc::new(move |unit| {
            read_json::<Value>(&page_dir.join(page_file_name(unit)))
                .ok()
                .flatten()
                .is_some()
        }));

        Ok(Self {
            name: name.to_string(),
            dir,
            metrics,
            checkpoint,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointTracker> {
        &self.checkpoint
    }

    /// Agent 运行日志目录
    pub fn log_dir(&self) -> PathBuf {
        self.dir.join(LOG_DIR)
    }

    pub fn page_path(&self, unit: UnitId) -> PathBuf {
        self.dir.join(page_file_name(unit))
    }

    /// 续跑校验改为「能按 T 解析」而不只是合法 JSON
    pub fn require_schema<T: DeserializeOwned + 'static>(&self) {
        let page_dir = self.dir.clone();
        self.checkpoint.set_validator(Arc::new(move |unit| {
            read_json::<T>(&page_dir.join(page_file_name(unit)))
                .ok()
                .flatten()
                .is_some()
        }));
    }

    pub fn save_page<T: Serialize + ?Sized>(&self, unit: UnitId, data: &T) -> Result<(), StorageError> {
        atomic::write_json(self.page_path(unit), data)
    }

    /// 读取页面输出：未处理返回 Ok(None)，结构不符返回 Schema 错误
    pub fn load_page<T: DeserializeOwned>(&self, unit: UnitId) -> Result<Option<T>, StorageError> {
        read_json(&self.page_path(unit))
    }

    /// 已有输出的单元编号（升序）
    pub fn list_pages(&self) -> Result<Vec<UnitId>, StorageError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let mut pages: Vec<UnitId> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(parse_page_file_name))
            .collect();
        pages.sort_unstable();
        Ok(pages)
    }

    /// 保存阶段内任意命名的 JSON 文件（如 toc.json）
    pub fn save_json<T: Serialize + ?Sized>(&self, name: &str, data: &T) -> Result<(), StorageError> {
        validate_name(name)?;
        atomic::write_json(self.dir.join(name), data)
    }

    pub fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        validate_name(name)?;
        read_json(&self.dir.join(name))
    }
}

/// 读取并解析 JSON；文件不存在为 None
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StorageError::Schema {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>, StorageError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::io(dir, e))?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|n| !n.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}
