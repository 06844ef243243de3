//! World archives: `.zip` or `.tar.gz` in, `.tar.gz` out.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        if name.ends_with(".zip") {
            Ok(Self::Zip)
        } else if name.ends_with(".tar.gz") {
            Ok(Self::TarGz)
        } else {
            anyhow::bail!("unsupported world archive: {name}")
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Zip => ".zip",
            Self::TarGz => ".tar.gz",
        }
    }
}

fn normalize_rel_path(rel: &str) -> anyhow::Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in Path::new(rel).components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => anyhow::bail!("path traversal is not allowed"),
            Component::Prefix(_) | Component::RootDir => anyhow::bail!("absolute path in archive"),
        }
    }
    Ok(out)
}

fn extract_zip(zip_path: &Path, out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)?;
    let f = fs::File::open(zip_path).with_context(|| format!("open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(f).context("read zip")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_rel_path(trimmed).with_context(|| format!("invalid zip path {trimmed:?}"))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = out_dir.join(&rel);
        if name.ends_with('/') {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out)?;
    }
    Ok(())
}

fn extract_tar_gz(path: &Path, out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)?;
    let f = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(f));
    for entry in archive.entries().context("read tar")? {
        let mut entry = entry?;
        // unpack_in refuses entries escaping out_dir.
        if !entry.unpack_in(out_dir)? {
            let p = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            anyhow::bail!("invalid tar path {p:?}");
        }
    }
    Ok(())
}

/// Shallowest directory holding a `level.dat`.
pub fn find_world_root(dir: &Path) -> Option<PathBuf> {
    let mut level = vec![dir.to_path_buf()];
    while !level.is_empty() {
        let mut next = Vec::new();
        for d in level {
            if d.join("level.dat").is_file() {
                return Some(d);
            }
            let Ok(rd) = fs::read_dir(&d) else { continue };
            let mut children: Vec<PathBuf> = rd
                .flatten()
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .filter(|e| e.file_name() != "__MACOSX")
                .map(|e| e.path())
                .collect();
            children.sort();
            next.extend(children);
        }
        level = next;
    }
    None
}

/// Extracts `archive` under `scratch` and moves its world into `world_dir`,
/// replacing whatever was there.
pub fn install_world(archive: &Path, kind: ArchiveKind, scratch: &Path, world_dir: &Path) -> anyhow::Result<()> {
    match kind {
        ArchiveKind::Zip => extract_zip(archive, scratch)?,
        ArchiveKind::TarGz => extract_tar_gz(archive, scratch)?,
    }
    let root = find_world_root(scratch).ok_or_else(|| anyhow::anyhow!("archive holds no level.dat"))?;

    crate::fs_util::remove_path(world_dir).with_context(|| format!("remove {}", world_dir.display()))?;
    if let Some(parent) = world_dir.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(&root, world_dir).is_err() {
        crate::fs_util::copy_dir_all(&root, world_dir)
            .with_context(|| format!("copy world into {}", world_dir.display()))?;
    }
    Ok(())
}

fn append_tree<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    name: &Path,
    skip_level_dat: bool,
) -> anyhow::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let file_name = entry.file_name();
        if skip_level_dat && file_name == "level.dat" {
            continue;
        }
        let ty = entry.file_type()?;
        let entry_name = name.join(&file_name);
        if ty.is_dir() {
            builder.append_dir(&entry_name, entry.path())?;
            append_tree(builder, &entry.path(), &entry_name, false)?;
        } else if ty.is_file() {
            builder.append_path_with_name(entry.path(), &entry_name)?;
        }
    }
    Ok(())
}

/// Packs `world_dir` as `world/...` with `level.dat` as the first file.
pub fn pack_world(world_dir: &Path, out: &Path) -> anyhow::Result<()> {
    let level_dat = world_dir.join("level.dat");
    if !level_dat.is_file() {
        anyhow::bail!("{} has no level.dat", world_dir.display());
    }
    let f = fs::File::create(out).with_context(|| format!("create {}", out.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(f, Compression::default()));
    let root = Path::new("world");
    builder.append_dir(root, world_dir)?;
    builder.append_path_with_name(&level_dat, root.join("level.dat"))?;
    append_tree(&mut builder, world_dir, root, true)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_world(dir: &Path) {
        fs::create_dir_all(dir.join("region")).unwrap();
        fs::write(dir.join("level.dat"), b"LEVEL").unwrap();
        fs::write(dir.join("a_first_alphabetically"), b"A").unwrap();
        fs::write(dir.join("region/r.0.0.mca"), b"REGION").unwrap();
    }

    #[test]
    fn archive_kind_follows_suffix() {
        assert_eq!(ArchiveKind::from_name("w/123.tar.gz").unwrap(), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::from_name("123.zip").unwrap(), ArchiveKind::Zip);
        assert!(ArchiveKind::from_name("123.tar.zst").is_err());
    }

    #[test]
    fn packed_world_puts_level_dat_first_and_installs_back() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("world");
        make_world(&world);
        let out = dir.path().join("world.tar.gz");
        pack_world(&world, &out).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(&out).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .filter(|n| !n.ends_with('/') && n != "world")
            .collect();
        assert_eq!(names[0], "world/level.dat");
        assert_eq!(names.iter().filter(|n| n.ends_with("level.dat")).count(), 1);

        let target = dir.path().join("gamedata/world");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale"), b"old").unwrap();
        install_world(&out, ArchiveKind::TarGz, &dir.path().join("scratch"), &target).unwrap();
        assert_eq!(fs::read(target.join("level.dat")).unwrap(), b"LEVEL");
        assert_eq!(fs::read(target.join("region/r.0.0.mca")).unwrap(), b"REGION");
        assert!(!target.join("stale").exists());
    }

    #[test]
    fn zip_with_nested_world_is_located() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("w.zip");
        {
            let mut zw = zip::ZipWriter::new(fs::File::create(&zip_path).unwrap());
            let opts = zip::write::SimpleFileOptions::default();
            zw.add_directory("MyWorld/", opts).unwrap();
            zw.start_file("MyWorld/level.dat", opts).unwrap();
            zw.write_all(b"LEVEL").unwrap();
            zw.start_file("readme.txt", opts).unwrap();
            zw.write_all(b"hi").unwrap();
            zw.finish().unwrap();
        }
        let target = dir.path().join("gamedata/world");
        install_world(&zip_path, ArchiveKind::Zip, &dir.path().join("scratch"), &target).unwrap();
        assert_eq!(fs::read(target.join("level.dat")).unwrap(), b"LEVEL");
    }

    #[test]
    fn zip_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("evil.zip");
        {
            let mut zw = zip::ZipWriter::new(fs::File::create(&zip_path).unwrap());
            zw.start_file("../escape", zip::write::SimpleFileOptions::default()).unwrap();
            zw.write_all(b"x").unwrap();
            zw.finish().unwrap();
        }
        let err = install_world(&zip_path, ArchiveKind::Zip, &dir.path().join("scratch"), &dir.path().join("w"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("traversal"));
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn archive_without_level_dat_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let not_world = dir.path().join("nw");
        fs::create_dir_all(&not_world).unwrap();
        assert!(pack_world(&not_world, &dir.path().join("x.tar.gz")).is_err());
    }
}
