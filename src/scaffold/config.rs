//! Per-device `config` file patching.
use regex::{NoExpand, Regex};
use std::path::Path;
use std::sync::OnceLock;

fn id_line() -> Option<&'static Regex> {
    static ID: OnceLock<Option<Regex>> = OnceLock::new();
    ID.get_or_init(|| Regex::new(r"(?mi)^[ \t]*id[ \t]*=.*$").ok())
        .as_ref()
}

fn nvram_line() -> Option<&'static Regex> {
    static NVRAM: OnceLock<Option<Regex>> = OnceLock::new();
    NVRAM
        .get_or_init(|| Regex::new(r"(?mi)^[ \t]*(#[ \t]*)?nvram[ \t]*=.*$").ok())
        .as_ref()
}

/// What [`patch_config`] did to the NVRAM reference.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NvramChange {
    Set { path: String },
    Commented { lines: usize },
}

/// Point the config at `firmware/<dir_name>` and set or disable its NVRAM
/// reference.
///
/// Only the first `id=` line is replaced; one is appended if none exists.
/// With `nvram` the first `nvram=` line (commented or not) is replaced,
/// otherwise every active `nvram=` line is commented out.
pub fn patch_config(text: &str, dir_name: &str, nvram: Option<&Path>) -> (String, NvramChange) {
    let id = format!("id=firmware/{dir_name}");
    let mut text = replace_first_or_append(text, id_line(), &id);

    let change = match nvram {
        Some(path) => {
            let line = format!("nvram={}", path.display());
            text = replace_first_or_append(&text, nvram_line(), &line);
            NvramChange::Set {
                path: path.display().to_string(),
            }
        }
        None => {
            let mut lines = 0;
            if let Some(re) = nvram_line() {
                text = re
                    .replace_all(&text, |caps: &regex::Captures<'_>| {
                        let line = &caps[0];
                        if line.trim_start().starts_with('#') {
                            line.to_string()
                        } else {
                            lines += 1;
                            format!("# {line}")
                        }
                    })
                    .into_owned();
            }
            NvramChange::Commented { lines }
        }
    };
    (text, change)
}

fn replace_first_or_append(text: &str, pattern: Option<&Regex>, line: &str) -> String {
    if let Some(re) = pattern.filter(|re| re.is_match(text)) {
        return re.replacen(text, 1, NoExpand(line)).into_owned();
    }
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
    out
}
