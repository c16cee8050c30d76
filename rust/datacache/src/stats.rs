//! Line-oriented statistics persisted across restarts.
//!
//! The format is one `name : value` pair per line, values printed as
//! decimal floats.  Readers must ignore names they do not know, so new
//! counters are non-breaking additions.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::config::STATS_FILE;

/// Write the stats file under `meta_path`, replacing any previous one.
pub(crate) fn dump_stats(meta_path: &Path, pairs: &BTreeMap<String, f64>) -> std::io::Result<()> {
    std::fs::create_dir_all(meta_path)?;
    let path = meta_path.join(STATS_FILE);
    let mut file = std::fs::File::create(&path)?;
    for (name, value) in pairs {
        writeln!(file, "{} : {}", name, value)?;
    }
    file.sync_all()
}

/// Load a prior stats file if one exists.  Unparseable lines are skipped;
/// the stats are reporting-only so a partial read is fine.
pub(crate) fn load_stats(meta_path: &Path) -> BTreeMap<String, f64> {
    let path = meta_path.join(STATS_FILE);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return BTreeMap::new();
    };
    let mut pairs = BTreeMap::new();
    for line in contents.lines() {
        let Some((name, value)) = line.split_once(" : ") else {
            continue;
        };
        if let Ok(value) = value.trim().parse::<f64>() {
            pairs.insert(name.trim().to_string(), value);
        }
    }
    pairs
}
