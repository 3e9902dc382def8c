//! `[General]`/`[Taint]`/`[Tracer]` INI configuration (spec §6).
//!
//! Mirrors `lochsdbg.ini` from the original tool: one flat file, three
//! sections, read once at startup and threaded explicitly through the
//! engine rather than stashed in a global (spec §9's note on `g_config`).

use anyhow::{Context, Result};
use ini::Ini;
use std::path::Path;

use crate::taint::rules::TaintRules;

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub enabled: bool,
    pub archive_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            archive_dir: "archive".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaintConfig {
    pub rules: TaintRules,
}

impl Default for TaintConfig {
    fn default() -> Self {
        Self {
            rules: TaintRules::empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub max_traces: usize,
    pub merge_call_jmp: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            max_traces: 1 << 20,
            merge_call_jmp: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub general: GeneralConfig,
    pub taint: TaintConfig,
    pub tracer: TracerConfig,
}

impl Config {
    /// Loads configuration from an INI file. A missing file is not an
    /// error: callers get defaults, matching the archive-load policy of
    /// spec §7 ("missing file is benign").
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        let mut cfg = Self::default();

        if let Some(section) = ini.section(Some("General")) {
            if let Some(v) = section.get("Enabled") {
                cfg.general.enabled = parse_bool(v);
            }
            if let Some(v) = section.get("ArchiveDir") {
                cfg.general.archive_dir = v.to_string();
            }
        }

        if let Some(section) = ini.section(Some("Taint")) {
            if let Some(v) = section.get("Rules") {
                cfg.taint.rules = TaintRules::from_bits_truncate(parse_u32(v));
            }
        }

        if let Some(section) = ini.section(Some("Tracer")) {
            if let Some(v) = section.get("MaxTraces") {
                cfg.tracer.max_traces = v.parse().unwrap_or(cfg.tracer.max_traces);
            }
            if let Some(v) = section.get("MergeCallJmp") {
                cfg.tracer.merge_call_jmp = parse_bool(v);
            }
        }

        Ok(cfg)
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_u32(s: &str) -> u32 {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        s.parse().unwrap_or(0)
    }
}
