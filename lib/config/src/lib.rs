//! # Armada Config
//!
//! Loads the agent's toml config files, interpolates `${VAR}` env
//! variables, and merges multiple files into the final configuration
//! object. Paths coming later in the list override earlier ones.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

mod error;

pub use error::Error;

pub type Result<T> = ::core::result::Result<T, Error>;

pub struct ConfigLoader<'outer, 'inner> {
  /// Paths to either files or directories to include in the final
  /// configuration. For directories, every `.toml` file directly
  /// inside is included in file name order.
  pub paths: &'outer [&'inner Path],
  /// Whether to merge nested config objects. Otherwise, the object is
  /// replaced at the top-level key by the highest priority file in
  /// which it is specified.
  pub merge_nested: bool,
  /// Whether to extend arrays across config files. Otherwise, the
  /// array is replaced at the top-level key by the highest priority
  /// file in which it is specified.
  pub extend_array: bool,
}

impl ConfigLoader<'_, '_> {
  pub fn load<T: DeserializeOwned>(self) -> Result<T> {
    let ConfigLoader {
      paths,
      merge_nested,
      extend_array,
    } = self;
    let mut merged = serde_json::Map::new();
    for path in collect_files(paths)? {
      let contents = std::fs::read_to_string(&path)
        .map_err(|e| Error::ReadFileContents {
          e,
          path: path.clone(),
        })?;
      let contents = interpolate_env(&contents);
      let parsed: serde_json::Value = toml::from_str(&contents)
        .map_err(|e| Error::ParseToml {
          e,
          path: path.clone(),
        })?;
      let serde_json::Value::Object(table) = parsed else {
        return Err(Error::FileIsNotTable { path });
      };
      merged =
        merge_objects(merged, table, merge_nested, extend_array)?;
    }
    serde_json::from_value(serde_json::Value::Object(merged))
      .map_err(|e| Error::ParseFinalJson { e })
  }
}

fn collect_files(paths: &[&Path]) -> Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  for &path in paths {
    let Ok(metadata) = std::fs::metadata(path) else {
      // Missing paths are skipped so a default install can point at
      // directories which do not exist yet.
      continue;
    };
    if metadata.is_file() {
      files.push(path.to_path_buf());
      continue;
    }
    let read_dir =
      std::fs::read_dir(path).map_err(|e| Error::ReadDir {
        path: path.to_path_buf(),
        e,
      })?;
    let mut dir_files = read_dir
      .flatten()
      .map(|entry| entry.path())
      .filter(|path| {
        path.is_file()
          && path.extension().is_some_and(|ext| ext == "toml")
      })
      .collect::<Vec<_>>();
    dir_files.sort();
    files.extend(dir_files);
  }
  Ok(files)
}

/// Only supports '${VAR}' syntax
fn interpolate_env(input: &str) -> String {
  let re = regex::Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap();
  let first_pass = re
    .replace_all(input, |caps: &regex::Captures| {
      let var_name = &caps[1];
      std::env::var(var_name).unwrap_or_default()
    })
    .into_owned();
  // Do it twice in case any env vars expand again to env vars
  re.replace_all(&first_pass, |caps: &regex::Captures| {
    let var_name = &caps[1];
    std::env::var(var_name).unwrap_or_default()
  })
  .into_owned()
}

/// - Source will override target.
/// - Recurses when field is object if merge_nested, otherwise the
///   object is replaced.
/// - Extends when field is array if extend_array, otherwise the array
///   is replaced.
/// - Errors when types on source and target fields do not match.
pub fn merge_objects(
  mut target: serde_json::Map<String, serde_json::Value>,
  source: serde_json::Map<String, serde_json::Value>,
  merge_nested: bool,
  extend_array: bool,
) -> Result<serde_json::Map<String, serde_json::Value>> {
  for (key, value) in source {
    let Some(curr) = target.remove(&key) else {
      target.insert(key, value);
      continue;
    };
    match (curr, value) {
      (serde_json::Value::Object(target_obj), value)
        if merge_nested =>
      {
        match value {
          serde_json::Value::Object(source_obj) => {
            target.insert(
              key,
              serde_json::Value::Object(merge_objects(
                target_obj,
                source_obj,
                merge_nested,
                extend_array,
              )?),
            );
          }
          value => {
            return Err(Error::ObjectFieldTypeMismatch {
              key,
              value,
            });
          }
        }
      }
      (serde_json::Value::Array(mut target_arr), value)
        if extend_array =>
      {
        match value {
          serde_json::Value::Array(source_arr) => {
            target_arr.extend(source_arr);
            target
              .insert(key, serde_json::Value::Array(target_arr));
          }
          value => {
            return Err(Error::ArrayFieldTypeMismatch {
              key,
              value,
            });
          }
        }
      }
      (_, value) => {
        target.insert(key, value);
      }
    }
  }
  Ok(target)
}
