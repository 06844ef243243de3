//! Just enough NBT to read the version a world was last saved with.

use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::Context;
use flate2::read::GzDecoder;

const TAG_END: u8 = 0;
const TAG_LIST: u8 = 9;
const TAG_COMPOUND: u8 = 10;
const TAG_STRING: u8 = 8;
const MAX_DEPTH: usize = 512;

fn read_u8(r: &mut impl Read) -> anyhow::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b).context("truncated nbt")?;
    Ok(b[0])
}

fn read_u16(r: &mut impl Read) -> anyhow::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b).context("truncated nbt")?;
    Ok(u16::from_be_bytes(b))
}

fn read_len(r: &mut impl Read) -> anyhow::Result<u64> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).context("truncated nbt")?;
    let n = i32::from_be_bytes(b);
    u64::try_from(n).map_err(|_| anyhow::anyhow!("negative nbt length {n}"))
}

fn read_string(r: &mut impl Read) -> anyhow::Result<String> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).context("truncated nbt string")?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn skip_bytes(r: &mut impl Read, n: u64) -> anyhow::Result<()> {
    let copied = std::io::copy(&mut r.by_ref().take(n), &mut std::io::sink())?;
    if copied != n {
        anyhow::bail!("truncated nbt payload");
    }
    Ok(())
}

fn skip_payload(r: &mut impl Read, tag: u8, depth: usize) -> anyhow::Result<()> {
    if depth > MAX_DEPTH {
        anyhow::bail!("nbt nested too deeply");
    }
    match tag {
        1 => skip_bytes(r, 1),
        2 => skip_bytes(r, 2),
        3 | 5 => skip_bytes(r, 4),
        4 | 6 => skip_bytes(r, 8),
        7 => {
            let n = read_len(r)?;
            skip_bytes(r, n)
        }
        TAG_STRING => {
            let n = read_u16(r)? as u64;
            skip_bytes(r, n)
        }
        TAG_LIST => {
            let elem = read_u8(r)?;
            let n = read_len(r)?;
            for _ in 0..n {
                skip_payload(r, elem, depth + 1)?;
            }
            Ok(())
        }
        TAG_COMPOUND => loop {
            let inner = read_u8(r)?;
            if inner == TAG_END {
                return Ok(());
            }
            read_string(r)?;
            skip_payload(r, inner, depth + 1)?;
        },
        11 => {
            let n = read_len(r)?;
            skip_bytes(r, n * 4)
        }
        12 => {
            let n = read_len(r)?;
            skip_bytes(r, n * 8)
        }
        other => anyhow::bail!("unknown nbt tag {other}"),
    }
}

/// Advances inside the current compound to the named field of type `tag`.
fn seek_field(r: &mut impl Read, name: &str, tag: u8) -> anyhow::Result<()> {
    loop {
        let t = read_u8(r)?;
        if t == TAG_END {
            anyhow::bail!("nbt field {name} not found");
        }
        let n = read_string(r)?;
        if n == name && t == tag {
            return Ok(());
        }
        skip_payload(r, t, 0)?;
    }
}

/// `Data.Version.Name` of an uncompressed level.dat stream.
pub fn parse_version_name(r: &mut impl Read) -> anyhow::Result<String> {
    if read_u8(r)? != TAG_COMPOUND {
        anyhow::bail!("level.dat root is not a compound");
    }
    read_string(r)?;
    seek_field(r, "Data", TAG_COMPOUND)?;
    seek_field(r, "Version", TAG_COMPOUND)?;
    seek_field(r, "Name", TAG_STRING)?;
    read_string(r)
}

pub fn read_version_name(path: &Path) -> anyhow::Result<String> {
    let f = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut r = GzDecoder::new(BufReader::new(f));
    parse_version_name(&mut r).with_context(|| format!("read version from {}", path.display()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_version_past_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("level.dat");
        std::fs::write(&path, testing::level_dat("1.20.4")).unwrap();
        assert_eq!(read_version_name(&path).unwrap(), "1.20.4");
    }

    #[test]
    fn missing_version_is_an_error() {
        // Root { Data { } }
        let raw = [10u8, 0, 0, 10, 0, 4, b'D', b'a', b't', b'a', 0, 0];
        let err = parse_version_name(&mut &raw[..]).unwrap_err();
        assert!(err.to_string().contains("Version"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_version_name(&mut &b"\x03\x00"[..]).is_err());
    }
}
