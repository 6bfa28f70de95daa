//! Ini persistence for [`MemoryParams`]

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::{debug, warn};

use super::{split_key, MemoryParams, ParameterStore};
use crate::error::ConfigError;

/// Load an ini file; `[video.0]` + `width = 1920` becomes `video.0:width`
pub fn load_ini(path: &Path) -> Result<MemoryParams, ConfigError> {
    let source = config::File::new(&path.to_string_lossy(), config::FileFormat::Ini);
    let root: BTreeMap<String, config::Value> = config::Config::builder()
        .add_source(source)
        .build()?
        .try_deserialize()?;

    let params = MemoryParams::new();
    for (name, value) in root {
        // Dotted section names arrive as nested tables
        match value.into_table() {
            Ok(table) => flatten(&params, &name, table)?,
            Err(_) => warn!("Ignoring key '{}' outside any section", name),
        }
    }

    debug!("Loaded {} parameters from {}", params.keys().len(), path.display());
    Ok(params)
}

fn flatten(
    params: &MemoryParams,
    section: &str,
    table: config::Map<String, config::Value>,
) -> Result<(), ConfigError> {
    for (name, value) in table {
        match value.clone().into_table() {
            Ok(child) => flatten(params, &format!("{section}.{name}"), child)?,
            Err(_) => params.set(&format!("{section}:{name}"), &value.into_string()?),
        }
    }
    Ok(())
}

/// Write parameters back as ini, atomically (temp file, then rename)
pub fn save_ini(params: &MemoryParams, path: &Path) -> Result<(), ConfigError> {
    let mut sections: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
    let snapshot = params.snapshot();
    for (key, value) in &snapshot {
        match split_key(key) {
            Some((section, name)) => sections.entry(section).or_default().push((name, value)),
            None => warn!("Not saving malformed key '{}'", key),
        }
    }

    let mut content = String::new();
    for (section, entries) in sections {
        content.push_str(&format!("[{section}]\n"));
        for (name, value) in entries {
            content.push_str(&format!("{name} = {value}\n"));
        }
        content.push('\n');
    }

    let temp_path = path.with_extension("ini.tmp");
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}
