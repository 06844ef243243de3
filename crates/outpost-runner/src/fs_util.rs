use std::fs;
use std::io;
use std::path::Path;

use anyhow::Context;
use tokio::io::AsyncWriteExt;

/// Writes via a sibling temp file and rename so readers never see a torn file.
pub async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all().await.ok();
    drop(f);
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

/// Recursively copies `src` into `dst`. Symlinks are recreated, not followed.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if ty.is_dir() {
            copy_dir_all(&from, &to)?;
        } else if ty.is_symlink() {
            #[cfg(unix)]
            {
                let target = fs::read_link(&from)?;
                std::os::unix::fs::symlink(target, &to)?;
            }
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("region")).unwrap();
        fs::write(src.join("level.dat"), b"L").unwrap();
        fs::write(src.join("region/r.0.0.mca"), b"R").unwrap();

        let dst = dir.path().join("dst");
        copy_dir_all(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("level.dat")).unwrap(), b"L");
        assert_eq!(fs::read(dst.join("region/r.0.0.mca")).unwrap(), b"R");
    }

    #[test]
    fn remove_path_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        remove_path(&dir.path().join("absent")).unwrap();
        let f = dir.path().join("f");
        fs::write(&f, b"x").unwrap();
        remove_path(&f).unwrap();
        assert!(!f.exists());
    }

    #[tokio::test]
    async fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nested/states.json");
        write_atomic(&p, b"{}").await.unwrap();
        write_atomic(&p, b"{\"a\":\"b\"}").await.unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"{\"a\":\"b\"}");
        assert!(!p.with_extension("tmp").exists());
    }
}
