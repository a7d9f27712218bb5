//! The core's CLI surface (§6) and the handful of configuration concerns
//! that sit outside the parser/graph/scheduler triple: argument parsing,
//! `MAKEFLAGS` environment round-tripping, the debug subsystem mask, and
//! default-input-file discovery.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use clap::Parser;

bitflags! {
    /// `-D`/`--debug` subsystem mask (§6). Purely diagnostic: nothing in
    /// the core triple reads this directly today, but it is threaded
    /// through so a `tracing` filter layer can be built from it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugMask: u32 {
        const ARCH  = 1 << 0;
        const MAKE  = 1 << 1;
        const PARSE = 1 << 2;
        const DIR   = 1 << 3;
        const GRAPH = 1 << 4;
        const JOBS  = 1 << 5;
    }
}

impl DebugMask {
    /// Parse a comma-separated list of subsystem names (`arch,make,parse`),
    /// or the single keyword `all`. Unknown names are ignored.
    pub fn parse(spec: &str) -> DebugMask {
        let mut mask = DebugMask::empty();
        for word in spec.split(',') {
            match word.trim().to_ascii_lowercase().as_str() {
                "arch" => mask |= DebugMask::ARCH,
                "make" => mask |= DebugMask::MAKE,
                "parse" => mask |= DebugMask::PARSE,
                "dir" => mask |= DebugMask::DIR,
                "graph" => mask |= DebugMask::GRAPH,
                "jobs" => mask |= DebugMask::JOBS,
                "all" => mask = DebugMask::all(),
                "" => {}
                _ => {}
            }
        }
        mask
    }
}

/// The CLI surface (§6): one `clap::Parser` struct observed by `mk-bin` and
/// nothing else — the core triple never looks at `Args` directly, only at
/// the `SchedulerConfig`/target list `mk-bin` derives from it.
#[derive(Parser, Debug, Clone)]
#[command(name = "mk", version, about = "A dependency-driven build engine")]
pub struct Args {
    /// Targets to build, and/or `NAME=VALUE` variable overrides, in any
    /// order. An empty target list falls back to `.MAIN`/the first mundane
    /// target the input declares.
    pub goals: Vec<String>,

    /// Parallelism limit.
    #[arg(short = 'j', long = "jobs", default_value_t = 1)]
    pub jobs: usize,

    /// Keep building independent targets after a sibling fails.
    #[arg(short = 'k', long = "keep-going")]
    pub keep_going: bool,

    /// Print commands without running them.
    #[arg(short = 'n', long = "no-execute", visible_aliases = ["dry-run", "just-print"])]
    pub no_execute: bool,

    /// Exit with a non-zero status as soon as a target would need rebuilding,
    /// without actually building anything.
    #[arg(short = 'q', long = "question")]
    pub question: bool,

    /// Treat command failures as warnings; keep going regardless.
    #[arg(short = 'i', long = "ignore-errors")]
    pub ignore_errors: bool,

    /// Don't echo commands before running them.
    #[arg(short = 's', long = "silent")]
    pub silent: bool,

    /// Touch targets instead of running their recipes.
    #[arg(short = 't', long = "touch", conflicts_with = "no_execute")]
    pub touch: bool,

    /// Enable extra lint-mode diagnostics.
    #[arg(long = "lint")]
    pub lint: bool,

    /// Input file(s) to parse instead of the default `Makefile`/`makefile`.
    #[arg(short = 'f', long = "file")]
    pub files: Vec<PathBuf>,

    /// Change to this directory before doing anything else.
    #[arg(short = 'C', long = "directory")]
    pub directory: Option<PathBuf>,

    /// Debug subsystem mask: comma-separated names, or `all`.
    #[arg(short = 'D', long = "debug")]
    pub debug: Option<String>,

    /// Promote warnings into the fatal count.
    #[arg(short = 'W', long = "warnings-as-errors")]
    pub warnings_as_errors: bool,

    /// Write a rolling log file here in addition to stderr (ambient, not
    /// consulted by the core triple).
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Parse `std::env::args()` with `MAKEFLAGS`-derived tokens spliced in
    /// ahead of the real command line, so a sub-invocation picks up its
    /// parent's effective flags (§6 "Environment").
    pub fn parse_with_makeflags() -> Args {
        let mut argv: Vec<String> = std::env::args().collect();
        let mut combined = vec![argv.remove(0)];
        combined.extend(makeflags_tokens());
        combined.extend(argv);
        Args::parse_from(combined)
    }

    pub fn debug_mask(&self) -> DebugMask {
        self.debug.as_deref().map(DebugMask::parse).unwrap_or_else(DebugMask::empty)
    }

    /// Split `goals` into `NAME=VALUE` command-line variable overrides and
    /// actual target names, in declaration order within each bucket.
    pub fn split_goals(&self) -> (Vec<(String, String)>, Vec<String>) {
        let mut overrides = Vec::new();
        let mut targets = Vec::new();
        for g in &self.goals {
            match g.split_once('=') {
                Some((name, value)) if is_identifier(name) => {
                    overrides.push((name.to_string(), value.to_string()));
                }
                _ => targets.push(g.clone()),
            }
        }
        (overrides, targets)
    }

    /// The `MAKEFLAGS`-style string this invocation's effective flags round
    /// trip to, for export into a child process's environment (§6).
    pub fn to_makeflags(&self) -> String {
        let mut flags = String::new();
        let mut short = String::new();
        if self.keep_going {
            short.push('k');
        }
        if self.ignore_errors {
            short.push('i');
        }
        if self.silent {
            short.push('s');
        }
        if self.no_execute {
            short.push('n');
        }
        if self.warnings_as_errors {
            short.push('W');
        }
        if !short.is_empty() {
            flags.push('-');
            flags.push_str(&short);
        }
        if self.jobs > 1 {
            if !flags.is_empty() {
                flags.push(' ');
            }
            flags.push_str(&format!("-j{}", self.jobs));
        }
        flags
    }

    /// Export this run's effective flags into `MAKEFLAGS` for child
    /// processes, and mirror `$(MAKE)` so `.MAKE`-tagged recursive targets
    /// find a usable recursive-invocation command (§6).
    pub fn export_makeflags(&self) {
        std::env::set_var("MAKEFLAGS", self.to_makeflags());
        if std::env::var_os("MAKE").is_none() {
            if let Ok(exe) = std::env::current_exe() {
                std::env::set_var("MAKE", exe.display().to_string());
            }
        }
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Re-tokenize `MAKEFLAGS` from the environment into argv-style tokens, each
/// prefixed with `-` if it isn't already one (classic `make` packs bare
/// letters like `k` into `MAKEFLAGS` without the leading dash).
fn makeflags_tokens() -> Vec<String> {
    let Some(raw) = std::env::var_os("MAKEFLAGS") else {
        return Vec::new();
    };
    let raw = raw.to_string_lossy().into_owned();
    raw.split_whitespace()
        .map(|tok| if tok.starts_with('-') { tok.to_string() } else { format!("-{tok}") })
        .collect()
}

/// Default input file discovery (§6): `Makefile` then `makefile` in `dir`.
pub fn discover_input_file(dir: &Path) -> Option<PathBuf> {
    for name in ["Makefile", "makefile"] {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
