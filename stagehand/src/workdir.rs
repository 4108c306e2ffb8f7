//! Scoped spawn work directories.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::Path;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use stagehand_shared::constants::WORK_DIR_PREFIX;
use stagehand_shared::layout::WorkDirLayout;

/// Largest file `read_all` will pick up; anything bigger is not an
/// annotation but payload.
const MAX_ANNOTATION_FILE_BYTES: u64 = 128 * 1024;

/// A per-spawn scratch directory, removed on drop.
///
/// All parent/child communication flows through this directory (layout in
/// [`WorkDirLayout`]). It is created before the fork and removed when the
/// handshake finishes, success or failure, unless [`WorkDir::detach`] was
/// called to retain it for diagnostics.
#[derive(Debug)]
pub struct WorkDir {
    layout: WorkDirLayout,
    keep: bool,
}

impl WorkDir {
    /// Creates `<base_dir>/stagehand.spawn.<id>` (mode 0700) with the full
    /// response/envdump tree and the `finish` FIFO. The `stdin` and
    /// `stdout_and_err` FIFOs exist only for preloader-spawned workers
    /// (`smart` = true); in the direct path those channels are inherited
    /// pipes instead.
    pub fn create(base_dir: &Path, smart: bool) -> io::Result<WorkDir> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let root = base_dir.join(format!("{WORK_DIR_PREFIX}{id}"));
        let layout = WorkDirLayout::new(&root);

        fs::DirBuilder::new().mode(0o700).create(&root)?;
        for dir in [
            layout.response_dir(),
            layout.steps_dir(),
            layout.error_dir(),
            layout.envdump_dir(),
            layout.annotations_dir(),
        ] {
            fs::DirBuilder::new().mode(0o700).create(&dir)?;
        }

        make_fifo(&layout.finish_fifo())?;
        if smart {
            make_fifo(&layout.stdin_fifo())?;
            make_fifo(&layout.stdout_and_err_fifo())?;
        }

        tracing::debug!(path = %root.display(), smart, "created spawn work directory");
        Ok(WorkDir {
            layout,
            keep: false,
        })
    }

    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &WorkDirLayout {
        &self.layout
    }

    /// Keeps the directory on drop, for post-mortem inspection.
    pub fn detach(&mut self) {
        self.keep = true;
    }

    /// Hands the directory tree to the identity the child will assume.
    /// The child writes its response files after dropping privileges, so
    /// root-created directories would otherwise be read-only to it.
    pub fn grant_to(&self, uid: u32, gid: u32) -> io::Result<()> {
        let uid = nix::unistd::Uid::from_raw(uid);
        let gid = nix::unistd::Gid::from_raw(gid);
        let mut paths = vec![
            self.layout.root().to_path_buf(),
            self.layout.response_dir(),
            self.layout.steps_dir(),
            self.layout.error_dir(),
            self.layout.envdump_dir(),
            self.layout.annotations_dir(),
            self.layout.finish_fifo(),
        ];
        for fifo in [self.layout.stdin_fifo(), self.layout.stdout_and_err_fifo()] {
            if fifo.exists() {
                paths.push(fifo);
            }
        }
        for path in paths {
            nix::unistd::chown(&path, Some(uid), Some(gid)).map_err(io::Error::from)?;
        }
        Ok(())
    }

    /// Reads every regular file under the work directory into a flat map of
    /// `relative/path -> contents`. FIFOs are skipped (opening one would
    /// block), as are unreadable and oversized files. Used to attach the
    /// whole directory as annotations to a diagnostic report.
    pub fn read_all(&self) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        collect_files(self.layout.root(), self.layout.root(), &mut files);
        files
    }
}

fn make_fifo(path: &Path) -> io::Result<()> {
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if file_type.is_dir() {
            collect_files(root, &path, out);
        } else if file_type.is_file() {
            if let Ok(metadata) = entry.metadata() {
                if metadata.len() > MAX_ANNOTATION_FILE_BYTES {
                    continue;
                }
            }
            if let Ok(contents) = fs::read(&path) {
                let key = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                out.insert(key, String::from_utf8_lossy(&contents).into_owned());
            }
        } else if file_type.is_fifo() {
            continue;
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            tracing::info!(path = %self.layout.root().display(), "retaining spawn work directory");
            return;
        }
        if let Err(e) = fs::remove_dir_all(self.layout.root()) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.layout.root().display(),
                    error = %e,
                    "failed to remove spawn work directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lays_out_the_tree() {
        let base = tempfile::tempdir().unwrap();
        let workdir = WorkDir::create(base.path(), true).unwrap();
        let layout = workdir.layout();

        assert!(layout.steps_dir().is_dir());
        assert!(layout.error_dir().is_dir());
        assert!(layout.annotations_dir().is_dir());
        for fifo in [
            layout.finish_fifo(),
            layout.stdin_fifo(),
            layout.stdout_and_err_fifo(),
        ] {
            let meta = fs::metadata(&fifo).unwrap();
            assert!(meta.file_type().is_fifo(), "{} is not a fifo", fifo.display());
        }

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(workdir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn direct_path_has_no_stdio_fifos() {
        let base = tempfile::tempdir().unwrap();
        let workdir = WorkDir::create(base.path(), false).unwrap();
        assert!(!workdir.layout().stdin_fifo().exists());
        assert!(!workdir.layout().stdout_and_err_fifo().exists());
        assert!(workdir.layout().finish_fifo().exists());
    }

    #[test]
    fn drop_removes_the_tree() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let workdir = WorkDir::create(base.path(), false).unwrap();
            workdir.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn detach_retains_the_tree() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let mut workdir = WorkDir::create(base.path(), false).unwrap();
            workdir.detach();
            workdir.path().to_path_buf()
        };
        assert!(path.exists());
    }

    #[test]
    fn read_all_skips_fifos_and_maps_relative_paths() {
        let base = tempfile::tempdir().unwrap();
        let workdir = WorkDir::create(base.path(), false).unwrap();
        fs::write(workdir.layout().error_summary(), "boom").unwrap();
        fs::write(workdir.layout().annotation_file("note"), "hello\n").unwrap();

        let all = workdir.read_all();
        assert_eq!(all.get("response/error/summary").map(String::as_str), Some("boom"));
        assert_eq!(
            all.get("envdump/annotations/note").map(String::as_str),
            Some("hello\n")
        );
        assert!(!all.contains_key("response/finish"));
    }
}
