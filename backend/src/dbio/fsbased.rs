//! The file-on-disk DBIO driver: one JSON file per record.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<coll>/<id>.json          record documents
//! <root>/prov_action_log/<id>.lis  action log, one JSON object per line
//! <root>/history/<id>.json         history archives (a JSON array)
//! <root>/nextnum/<shoulder>.json   sequence tops (a bare integer)
//! <root>/locks/<name>.lock         advisory lock files
//! ```
//!
//! Record identifiers may contain slashes (published version ids do);
//! those map onto subdirectories, created lazily.  Sequence minting and
//! record replacement are serialised across processes with advisory
//! file locks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::backend::{is_deactivated, matches_constraints, Constraint, DbBackend};
use super::{DbioError, Result, HISTORY_COLL, NEXTNUM_COLL, PROV_ACT_LOG};

pub struct FsBackend {
    root: PathBuf,
}

/// An exclusive advisory lock, held until dropped.
struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    fn acquire(root: &Path, name: &str) -> Result<FileLock> {
        let dir = root.join("locks");
        std::fs::create_dir_all(&dir).map_err(DbioError::backend)?;
        let path = dir.join(format!("{}.lock", name.replace(['/', ':'], "_")));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(DbioError::backend)?;
        file.lock_exclusive().map_err(DbioError::backend)?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl FsBackend {
    /// Open a file-backed store rooted at an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<FsBackend> {
        let root = root.into();
        if !root.is_dir() {
            return Err(DbioError::backend(format!(
                "FsBackend: {}: does not exist as a directory",
                root.display()
            )));
        }
        Ok(FsBackend { root })
    }

    fn rec_path(&self, coll: &str, id: &str) -> PathBuf {
        self.root.join(coll).join(format!("{id}.json"))
    }

    async fn read_rec(&self, coll: &str, id: &str) -> Result<Option<Value>> {
        let path = self.rec_path(coll, id);
        match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
                DbioError::backend(format!("{id}: Unable to read DB record as JSON: {e}"))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DbioError::backend(format!("{}: {e}", path.display()))),
        }
    }

    async fn write_rec(&self, coll: &str, id: &str, data: &Value) -> Result<bool> {
        let path = self.rec_path(coll, id);
        let parent = path
            .parent()
            .ok_or_else(|| DbioError::backend(format!("{id}: no parent directory")))?;
        fs::create_dir_all(parent).await.map_err(DbioError::backend)?;
        let exists = path.exists();
        let text = serde_json::to_string_pretty(data).map_err(DbioError::backend)?;
        fs::write(&path, text)
            .await
            .map_err(|e| DbioError::backend(format!("{id}: Unable to write DB record: {e}")))?;
        Ok(!exists)
    }

    /// Collect every record file under a collection directory,
    /// recursing into subdirectories (slash-bearing ids).
    async fn walk_records(&self, coll: &str) -> Result<Vec<Value>> {
        let collpath = self.root.join(coll);
        if !collpath.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut stack = vec![collpath];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(DbioError::backend)?;
            while let Some(entry) = entries.next_entry().await.map_err(DbioError::backend)? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|e| e == "json") {
                    match fs::read_to_string(&path).await {
                        Ok(text) => match serde_json::from_str::<Value>(&text) {
                            Ok(rec) => out.push(rec),
                            // skip over corrupted records
                            Err(_) => continue,
                        },
                        Err(e) => return Err(DbioError::backend(format!("{}: {e}", path.display()))),
                    }
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DbBackend for FsBackend {
    async fn upsert(&self, coll: &str, id: &str, rec: Value) -> Result<bool> {
        let _lock = FileLock::acquire(&self.root, &format!("{coll}-{id}"))?;
        self.write_rec(coll, id, &rec).await
    }

    async fn get(&self, coll: &str, id: &str) -> Result<Option<Value>> {
        self.read_rec(coll, id).await
    }

    async fn select(&self, coll: &str, incl_deact: bool, constraints: &[Constraint])
        -> Result<Vec<Value>>
    {
        Ok(self
            .walk_records(coll)
            .await?
            .into_iter()
            .filter(|rec| incl_deact || !is_deactivated(rec))
            .filter(|rec| matches_constraints(rec, constraints))
            .collect())
    }

    async fn select_prop_contains(&self, coll: &str, prop: &str, target: &str, incl_deact: bool)
        -> Result<Vec<Value>>
    {
        Ok(self
            .walk_records(coll)
            .await?
            .into_iter()
            .filter(|rec| incl_deact || !is_deactivated(rec))
            .filter(|rec| {
                rec.get(prop)
                    .and_then(Value::as_array)
                    .is_some_and(|l| l.iter().any(|v| v.as_str() == Some(target)))
            })
            .collect())
    }

    async fn delete(&self, coll: &str, id: &str) -> Result<bool> {
        let _lock = FileLock::acquire(&self.root, &format!("{coll}-{id}"))?;
        let path = self.rec_path(coll, id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DbioError::backend(format!("{}: {e}", path.display()))),
        }
    }

    async fn next_recnum(&self, shoulder: &str) -> Result<u32> {
        let _lock = FileLock::acquire(&self.root, &format!("nextnum-{shoulder}"))?;
        let num = self
            .read_rec(NEXTNUM_COLL, shoulder)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
            + 1;
        self.write_rec(NEXTNUM_COLL, shoulder, &Value::from(num)).await?;
        Ok(num)
    }

    async fn try_push_recnum(&self, shoulder: &str, recnum: u32) -> Result<()> {
        let _lock = FileLock::acquire(&self.root, &format!("nextnum-{shoulder}"))?;
        let Some(top) = self.read_rec(NEXTNUM_COLL, shoulder).await?.and_then(|v| v.as_u64())
        else {
            return Ok(());
        };
        if top as u32 == recnum {
            self.write_rec(NEXTNUM_COLL, shoulder, &Value::from(recnum - 1)).await?;
        }
        Ok(())
    }

    async fn save_action(&self, subject: &str, act: Value) -> Result<()> {
        if subject.is_empty() {
            return Err(DbioError::backend("save_action: missing subject id"));
        }
        let dir = self.root.join(PROV_ACT_LOG);
        fs::create_dir_all(&dir).await.map_err(DbioError::backend)?;
        let path = dir.join(format!("{subject}.lis"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(DbioError::backend)?;
        }
        let mut line = serde_json::to_string(&act).map_err(DbioError::backend)?;
        line.push('\n');
        let mut fd = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| DbioError::backend(format!("{subject}: Unable to append action: {e}")))?;
        fd.write_all(line.as_bytes())
            .await
            .map_err(|e| DbioError::backend(format!("{subject}: Unable to append action: {e}")))?;
        Ok(())
    }

    async fn select_actions_for(&self, id: &str) -> Result<Vec<Value>> {
        let path = self.root.join(PROV_ACT_LOG).join(format!("{id}.lis"));
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DbioError::backend(format!("{id}: Unable to read actions: {e}"))),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| DbioError::backend(format!("{id}: Unable to read actions: {e}")))
            })
            .collect()
    }

    async fn delete_actions_for(&self, id: &str) -> Result<()> {
        let path = self.root.join(PROV_ACT_LOG).join(format!("{id}.lis"));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbioError::backend(format!("{}: {e}", path.display()))),
        }
    }

    async fn save_history(&self, recid: &str, hist: Value) -> Result<()> {
        let _lock = FileLock::acquire(&self.root, &format!("history-{recid}"))?;
        let mut entries = match self.read_rec(HISTORY_COLL, recid).await? {
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(DbioError::backend(format!("{recid}: history document is not an array")))
            }
            None => Vec::new(),
        };
        entries.push(hist);
        self.write_rec(HISTORY_COLL, recid, &Value::Array(entries)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn backend() -> (TempDir, FsBackend) {
        let dir = TempDir::new().unwrap();
        let be = FsBackend::new(dir.path()).unwrap();
        (dir, be)
    }

    #[tokio::test]
    async fn test_missing_root_rejected() {
        assert!(FsBackend::new("/no/such/dbio/root").is_err());
    }

    #[tokio::test]
    async fn test_record_files_round_trip() {
        let (dir, db) = backend();
        assert!(db.upsert("dmp", "mdm1:0001", json!({"id": "mdm1:0001"})).await.unwrap());
        assert!(dir.path().join("dmp").join("mdm1:0001.json").is_file());

        assert!(!db.upsert("dmp", "mdm1:0001", json!({"id": "mdm1:0001", "name": "x"})).await.unwrap());
        assert_eq!(db.get("dmp", "mdm1:0001").await.unwrap().unwrap()["name"], "x");

        assert!(db.delete("dmp", "mdm1:0001").await.unwrap());
        assert!(!db.delete("dmp", "mdm1:0001").await.unwrap());
    }

    #[tokio::test]
    async fn test_slashed_ids_nest() {
        let (dir, db) = backend();
        let id = "ark:/88434/mdm1-0001/pdr:v/1.0.0";
        db.upsert("dmp_version", id, json!({"id": id})).await.unwrap();
        assert!(dir
            .path()
            .join("dmp_version/ark:/88434/mdm1-0001/pdr:v/1.0.0.json")
            .is_file());
        assert!(db.get("dmp_version", id).await.unwrap().is_some());
        assert_eq!(db.select("dmp_version", false, &[]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sequence_files() {
        let (dir, db) = backend();
        assert_eq!(db.next_recnum("mdm1").await.unwrap(), 1);
        assert_eq!(db.next_recnum("mdm1").await.unwrap(), 2);
        assert!(dir.path().join("nextnum/mdm1.json").is_file());

        db.try_push_recnum("mdm1", 2).await.unwrap();
        assert_eq!(db.next_recnum("mdm1").await.unwrap(), 2);
        // pushing a stale number is a no-op
        db.try_push_recnum("mdm1", 1).await.unwrap();
        assert_eq!(db.next_recnum("mdm1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_action_listfile() {
        let (dir, db) = backend();
        db.save_action("mdm1:0001", json!({"type": "CREATE"})).await.unwrap();
        db.save_action("mdm1:0001", json!({"type": "PATCH"})).await.unwrap();

        let lis = dir.path().join("prov_action_log/mdm1:0001.lis");
        assert!(lis.is_file());
        assert_eq!(std::fs::read_to_string(&lis).unwrap().lines().count(), 2);

        let acts = db.select_actions_for("mdm1:0001").await.unwrap();
        assert_eq!(acts[0]["type"], "CREATE");
        assert_eq!(acts[1]["type"], "PATCH");

        db.delete_actions_for("mdm1:0001").await.unwrap();
        assert!(!lis.exists());
    }

    #[tokio::test]
    async fn test_history_array_file() {
        let (dir, db) = backend();
        db.save_history("mdm1:0001", json!({"recid": "mdm1:0001", "close_action": "DELETE"}))
            .await
            .unwrap();
        db.save_history("mdm1:0001", json!({"recid": "mdm1:0001", "close_action": "PROCESS"}))
            .await
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join("history/mdm1:0001.json")).unwrap();
        let arr: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(arr.as_array().unwrap().len(), 2);
    }
}
