//! 原子写入：同目录临时文件 + rename
//!
//! 读者只会看到旧版本或新版本的完整文件。StagedWrite 把「写临时文件」与「rename 提交」拆开，
//! 未提交即 drop 时临时文件被删除，目标文件保持原样。

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::core::StorageError;

/// 已写入并 fsync 的临时文件，commit 之前目标文件不受影响
pub struct StagedWrite {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    /// 在目标文件同目录创建临时文件并写入全部字节；父目录不存在时自动创建
    pub fn stage(target: impl AsRef<Path>, bytes: &[u8]) -> Result<Self, StorageError> {
        let target = target.as_ref().to_path_buf();
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StorageError::io(&dir, e))?;
        tmp.write_all(bytes)
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        Ok(Self { tmp, target })
    }

    /// 临时文件路径（测试用）
    pub fn temp_path(&self) -> &Path {
        self.tmp.path()
    }

    /// rename 到目标路径
    pub fn commit(self) -> Result<(), StorageError> {
        let target = self.target;
        self.tmp
            .persist(&target)
            .map_err(|e| StorageError::io(&target, e.error))?;
        Ok(())
    }
}

pub fn write_bytes(path: impl AsRef<Path>, bytes: &[u8]) -> Result<(), StorageError> {
    StagedWrite::stage(path, bytes)?.commit()
}

/// 序列化为带缩进的 JSON 后原子写入
pub fn write_json<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_json_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.json");
        write_json(&path, &serde_json::json!({"ok": true})).unwrap();
        let back: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back["ok"], true);
    }

    #[test]
    fn test_uncommitted_write_leaves_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        write_bytes(&path, b"{\"v\": 1}").unwrap();

        let staged = StagedWrite::stage(&path, b"{\"v\": 2, \"trunc").unwrap();
        let tmp = staged.temp_path().to_path_buf();
        assert!(tmp.exists());
        drop(staged);

        assert!(!tmp.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\": 1}");
    }

    #[test]
    fn test_commit_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        write_bytes(&path, b"old").unwrap();
        StagedWrite::stage(&path, b"new").unwrap().commit().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
