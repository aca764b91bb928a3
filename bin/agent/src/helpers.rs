use std::{
  fs,
  io::Write,
  os::unix::fs::OpenOptionsExt,
  path::Path,
};

use anyhow::Context;

/// Writes contents to path through `<path>.tmp` + rename, so readers
/// only ever observe the previous contents or the new contents.
pub fn atomic_write(
  path: &Path,
  contents: &[u8],
  mode: u32,
) -> anyhow::Result<()> {
  let parent = path
    .parent()
    .with_context(|| format!("{path:?} has no parent directory"))?;
  let file_name = path
    .file_name()
    .and_then(|name| name.to_str())
    .with_context(|| format!("{path:?} has no file name"))?;
  let tmp = parent.join(format!("{file_name}.tmp"));
  let mut file = fs::OpenOptions::new()
    .write(true)
    .create(true)
    .truncate(true)
    .mode(mode)
    .open(&tmp)
    .with_context(|| format!("failed to open {tmp:?}"))?;
  file
    .write_all(contents)
    .with_context(|| format!("failed to write {tmp:?}"))?;
  file
    .sync_all()
    .with_context(|| format!("failed to sync {tmp:?}"))?;
  drop(file);
  fs::rename(&tmp, path)
    .with_context(|| format!("failed to rename {tmp:?} to {path:?}"))
}

/// Reads the file if it exists. Absence is `None`,
/// any other io error is `Err`.
pub fn read_optional_file(
  path: &Path,
) -> anyhow::Result<Option<Vec<u8>>> {
  match fs::read(path) {
    Ok(contents) => Ok(Some(contents)),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => {
      Err(e).with_context(|| format!("failed to read {path:?}"))
    }
  }
}

pub fn read_optional_string(
  path: &Path,
) -> anyhow::Result<Option<String>> {
  let Some(contents) = read_optional_file(path)? else {
    return Ok(None);
  };
  let contents = String::from_utf8(contents)
    .with_context(|| format!("{path:?} is not valid utf8"))?;
  Ok(Some(contents.trim().to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn atomic_write_replaces_previous_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");
    atomic_write(&path, b"first", 0o644).unwrap();
    atomic_write(&path, b"second", 0o644).unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"second");
    // No temp file left behind.
    assert!(!dir.path().join("state.tmp").exists());
  }

  #[test]
  fn atomic_write_sets_mode() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("access-key");
    atomic_write(&path, b"key", 0o600).unwrap();
    let mode =
      fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
  }

  #[test]
  fn read_optional_tolerates_absence() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(
      read_optional_file(&dir.path().join("missing")).unwrap(),
      None
    );
    let path = dir.path().join("device-id");
    atomic_write(&path, b"dev_1\n", 0o600).unwrap();
    assert_eq!(
      read_optional_string(&path).unwrap().as_deref(),
      Some("dev_1")
    );
  }
}
