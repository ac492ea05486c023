//! Filesystem changes with an undo log.
//!
//! Every mutation pushes its inverse before (or as) it happens. Replaced and
//! deleted files are moved into a scratch directory rather than destroyed, so
//! unwinding the log restores the tree exactly. Dropping an uncommitted
//! transaction rolls it back.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

#[derive(Debug)]
enum Undo {
    CreatedFile(PathBuf),
    CreatedDir(PathBuf),
    Replaced { path: PathBuf, backup: PathBuf },
    Deleted { path: PathBuf, backup: PathBuf },
    RemovedDir(PathBuf),
}

#[derive(Debug)]
pub struct FileTransaction {
    scratch: TempDir,
    undo: Vec<Undo>,
    backups: usize,
    finished: bool,
}

impl FileTransaction {
    /// Starts a transaction keeping its backups under `scratch_root`.
    ///
    /// `scratch_root` should be on the same filesystem as the files touched
    /// so backups are renames, not copies.
    pub fn new(scratch_root: &Path) -> io::Result<Self> {
        fs::create_dir_all(scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix("txn-")
            .tempdir_in(scratch_root)?;
        Ok(Self {
            scratch,
            undo: Vec::new(),
            backups: 0,
            finished: false,
        })
    }

    fn next_backup(&mut self) -> PathBuf {
        self.backups += 1;
        self.scratch.path().join(self.backups.to_string())
    }

    /// Creates `dir` and any missing parents. Returns the directories created, outermost first.
    pub fn create_dir_all(&mut self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(path) = current {
            if path.as_os_str().is_empty() || path.is_dir() {
                break;
            }
            missing.push(path.to_path_buf());
            current = path.parent();
        }
        missing.reverse();
        for path in &missing {
            fs::create_dir(path)?;
            self.undo.push(Undo::CreatedDir(path.clone()));
        }
        Ok(missing)
    }

    /// Writes everything from `reader` to `dest`.
    ///
    /// An existing file is an [`io::ErrorKind::AlreadyExists`] error unless
    /// `overwrite` is set, in which case it is backed up first.
    pub fn write_from<R: Read + ?Sized>(
        &mut self,
        dest: &Path,
        reader: &mut R,
        overwrite: bool,
    ) -> io::Result<u64> {
        if dest.exists() {
            if !overwrite {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", dest.display()),
                ));
            }
            let backup = self.next_backup();
            move_file(dest, &backup)?;
            self.undo.push(Undo::Replaced {
                path: dest.to_path_buf(),
                backup,
            });
        } else {
            self.undo.push(Undo::CreatedFile(dest.to_path_buf()));
        }

        let mut file = File::create(dest)?;
        io::copy(reader, &mut file)
    }

    /// Removes a file, keeping a backup until commit.
    pub fn remove_file(&mut self, path: &Path) -> io::Result<()> {
        let backup = self.next_backup();
        move_file(path, &backup)?;
        self.undo.push(Undo::Deleted {
            path: path.to_path_buf(),
            backup,
        });
        Ok(())
    }

    /// Removes `dir` if it exists and is empty. Returns whether it was removed.
    pub fn remove_dir_if_empty(&mut self, dir: &Path) -> io::Result<bool> {
        if !dir.is_dir() || fs::read_dir(dir)?.next().is_some() {
            return Ok(false);
        }
        fs::remove_dir(dir)?;
        self.undo.push(Undo::RemovedDir(dir.to_path_buf()));
        Ok(true)
    }

    /// Keeps every change and discards the backups.
    pub fn commit(mut self) {
        debug!(operations = self.undo.len(), "Committing file transaction");
        self.undo.clear();
        self.finished = true;
    }

    /// Undoes every change, newest first.
    ///
    /// # Errors
    ///
    /// Returns the first failure; unwinding continues past it.
    pub fn rollback(mut self) -> io::Result<()> {
        self.finished = true;
        self.unwind()
    }

    fn unwind(&mut self) -> io::Result<()> {
        debug!(operations = self.undo.len(), "Rolling back file transaction");
        let mut first_error = None;
        while let Some(op) = self.undo.pop() {
            let result = match &op {
                Undo::CreatedFile(path) => match fs::remove_file(path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                },
                Undo::CreatedDir(path) => match fs::remove_dir(path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                },
                Undo::Replaced { path, backup } => {
                    let _ = fs::remove_file(path);
                    move_file(backup, path)
                }
                Undo::Deleted { path, backup } => move_file(backup, path),
                Undo::RemovedDir(path) => fs::create_dir_all(path),
            };
            if let Err(e) = result {
                warn!(?op, error = %e, "Failed to undo file operation");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for FileTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.undo.is_empty() {
            if let Err(e) = self.unwind() {
                warn!(error = %e, "Rollback on drop was incomplete");
            }
        }
    }
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_restores_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("game");
        fs::create_dir_all(root.join("keep")).unwrap();
        fs::write(root.join("keep/old.txt"), b"old").unwrap();
        fs::write(root.join("keep/victim.txt"), b"victim").unwrap();

        let mut tx = FileTransaction::new(&dir.path().join("scratch")).unwrap();
        let created = tx.create_dir_all(&root.join("new/deep")).unwrap();
        assert_eq!(created, vec![root.join("new"), root.join("new/deep")]);
        tx.write_from(&root.join("new/deep/a.bin"), &mut &b"\x00\xff"[..], false)
            .unwrap();
        tx.write_from(&root.join("keep/old.txt"), &mut &b"new"[..], true)
            .unwrap();
        tx.remove_file(&root.join("keep/victim.txt")).unwrap();
        assert_eq!(fs::read(root.join("keep/old.txt")).unwrap(), b"new");
        tx.rollback().unwrap();

        assert!(!root.join("new").exists());
        assert_eq!(fs::read(root.join("keep/old.txt")).unwrap(), b"old");
        assert_eq!(fs::read(root.join("keep/victim.txt")).unwrap(), b"victim");
    }

    #[test]
    fn test_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f");
        fs::write(&target, b"mine").unwrap();
        let mut tx = FileTransaction::new(&dir.path().join("scratch")).unwrap();
        let err = tx.write_from(&target, &mut &b"theirs"[..], false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        drop(tx);
        assert_eq!(fs::read(&target).unwrap(), b"mine");
    }

    #[test]
    fn test_drop_rolls_back_and_commit_keeps() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        {
            let mut tx = FileTransaction::new(&scratch).unwrap();
            tx.write_from(&dir.path().join("gone"), &mut &b"x"[..], false)
                .unwrap();
        }
        assert!(!dir.path().join("gone").exists());

        let mut tx = FileTransaction::new(&scratch).unwrap();
        tx.write_from(&dir.path().join("kept"), &mut &b"x"[..], false)
            .unwrap();
        tx.commit();
        assert!(dir.path().join("kept").exists());
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_dir_if_empty() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("full");
        let empty = dir.path().join("empty");
        fs::create_dir_all(&full).unwrap();
        fs::create_dir_all(&empty).unwrap();
        fs::write(full.join("f"), b"").unwrap();

        let mut tx = FileTransaction::new(&dir.path().join("scratch")).unwrap();
        assert!(!tx.remove_dir_if_empty(&full).unwrap());
        assert!(tx.remove_dir_if_empty(&empty).unwrap());
        assert!(!empty.exists());
        tx.rollback().unwrap();
        assert!(empty.is_dir());
    }
}
