//! `mk`: the CLI entrypoint wiring the parser, graph expansion and
//! scheduler together against a set of input files (§6).

use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::{anyhow, Context, Result};
use core_config::Args;
use core_diag::format_target_report;
use core_exec::JobRunner;
use core_graph::SuffixRules;
use core_model::Handle;
use core_parser::Parser;
use core_sched::{outcome, Scheduler, SchedulerConfig};
use core_vars::VarEngine;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        AppStartup { log_guard: None }
    }

    /// `tracing` + `tracing-subscriber` to stderr, plus an optional rolling
    /// file writer when `--log-file` is given (§10.1 of the expanded spec).
    fn configure_logging(&mut self, log_file: Option<&Path>) -> Result<()> {
        let builder = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env());

        let result = if let Some(path) = log_file {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().ok_or_else(|| anyhow!("--log-file must name a file"))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            self.log_guard = Some(guard);
            builder.with_writer(writer).try_init()
        } else {
            builder.try_init()
        };

        if let Err(_err) = result {
            // A subscriber is already installed (e.g. under `cargo test`); keep going.
        }
        Ok(())
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "runtime.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

fn main() -> Result<()> {
    let args = Args::parse_with_makeflags();

    if let Some(dir) = &args.directory {
        std::env::set_current_dir(dir).with_context(|| format!("-C {}: could not chdir", dir.display()))?;
    }

    let mut startup = AppStartup::new();
    startup.configure_logging(args.log_file.as_deref())?;
    AppStartup::install_panic_hook();
    args.export_makeflags();

    info!(target: "runtime", jobs = args.jobs, keep_going = args.keep_going, "startup");

    let exit_code = run(&args)?;
    std::process::exit(exit_code);
}

fn run(args: &Args) -> Result<i32> {
    let input_files = resolve_input_files(args)?;
    let (overrides, target_names) = args.split_goals();

    let mut vars = VarEngine::new();
    for (name, value) in &overrides {
        vars.set_command_line(name, value);
    }

    let mut parser = Parser::new(vars).with_warnings_as_errors(args.warnings_as_errors);
    parser.command_line_targets = target_names;

    for file in &input_files {
        parser.parse_file(file.clone())?;
    }

    if parser.diagnostics.has_fatal() {
        eprint!("{}", parser.diagnostics.summary());
        return Ok(1);
    }

    let goal_names = parser.default_targets();
    if goal_names.is_empty() {
        return Err(anyhow!("no targets specified and no target found in `{}`", display_list(&input_files)));
    }
    let roots: Vec<Handle> = goal_names.iter().map(|name| parser.graph.get(name)).collect();

    let rules = SuffixRules {
        suffixes: parser.suffixes.clone(),
        default_node: parser.default_node,
    };
    let shell = parser.shell_override.clone().unwrap_or_else(|| "/bin/sh".to_string());
    let jobs = if parser.notparallel { 1 } else { args.jobs.max(1) };

    let Parser {
        mut graph,
        mut vars,
        mut diagnostics,
        paths,
        delete_on_error,
        notparallel: _,
        singleshell: _,
        ..
    } = parser;

    let main = core_graph::expand(&mut graph, &mut vars, &paths, &rules, &roots);

    let runner = JobRunner::new(jobs, shell.clone());
    let config = SchedulerConfig {
        keep_going: args.keep_going,
        query_only: args.question,
        silent: args.silent,
        ignore_errors: args.ignore_errors,
        touch_only: args.touch,
        no_execute: args.no_execute,
        delete_on_error,
        shell,
    };

    let scheduler = Scheduler::new(&mut graph, &mut vars, &runner, &mut diagnostics, config);
    let summary = scheduler.run(main);

    if args.question {
        return Ok(if summary.would_build { 1 } else { 0 });
    }

    for (name, &root) in goal_names.iter().zip(roots.iter()) {
        println!("{}", format_target_report(name, outcome(&graph, root)));
    }

    if diagnostics.has_fatal() {
        eprint!("{}", diagnostics.summary());
    }

    Ok(if summary.job_failures > 0 || diagnostics.has_fatal() { 1 } else { 0 })
}

fn display_list(paths: &[PathBuf]) -> String {
    paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
}

/// Resolve the input file(s) for this run: `-f`/`--file` (repeatable, in
/// order) if given, else `Makefile`/`makefile` discovery in the current
/// directory (§6, §10.3).
fn resolve_input_files(args: &Args) -> Result<Vec<PathBuf>> {
    if !args.files.is_empty() {
        return Ok(args.files.clone());
    }
    let cwd = std::env::current_dir().context("could not read current directory")?;
    core_config::discover_input_file(&cwd)
        .map(|p| vec![p])
        .ok_or_else(|| anyhow!("no makefile found (looked for Makefile, makefile)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_makefile(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("Makefile");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn base_args(file: PathBuf, goals: Vec<String>) -> Args {
        Args {
            goals,
            jobs: 1,
            keep_going: false,
            no_execute: false,
            question: false,
            ignore_errors: false,
            silent: true,
            touch: false,
            lint: false,
            files: vec![file],
            directory: None,
            debug: None,
            warnings_as_errors: false,
            log_file: None,
        }
    }

    #[test]
    fn simple_up_to_date_build_dispatches_only_the_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let foo = dir.path().join("foo");
        std::fs::write(&foo, "x").unwrap();
        let makefile = write_makefile(
            dir.path(),
            &format!("all: {}\n", foo.display()),
        );

        let args = base_args(makefile, vec!["all".to_string()]);
        let code = run(&args).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn force_target_always_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let makefile = write_makefile(
            dir.path(),
            &format!("clean!\n\ttouch {}\n", marker.display()),
        );

        let args = base_args(makefile, vec!["clean".to_string()]);
        let code = run(&args).unwrap();
        assert_eq!(code, 0);
        assert!(marker.exists());
    }

    #[test]
    fn fatal_parse_error_exits_nonzero_without_building() {
        let dir = tempfile::tempdir().unwrap();
        let makefile = write_makefile(dir.path(), "this is not a dependency line and has no operator\n");

        let args = base_args(makefile, vec![]);
        let code = run(&args).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn job_failure_exits_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let makefile = write_makefile(dir.path(), "all!\n\tfalse\n");

        let args = base_args(makefile, vec!["all".to_string()]);
        let code = run(&args).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn command_line_override_reaches_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let makefile = write_makefile(
            dir.path(),
            &format!("all!\n\techo $(MSG) > {}\n", out.display()),
        );

        let mut args = base_args(makefile, vec!["all".to_string(), "MSG=hello".to_string()]);
        args.goals = vec!["MSG=hello".to_string(), "all".to_string()];
        let code = run(&args).unwrap();
        assert_eq!(code, 0);
        let content = std::fs::read_to_string(&out).unwrap();
        assert_eq!(content.trim(), "hello");
    }

    #[test]
    fn resolve_input_files_falls_back_to_discovery() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "all:\n").unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let args = Args {
            goals: vec![],
            jobs: 1,
            keep_going: false,
            no_execute: false,
            question: false,
            ignore_errors: false,
            silent: false,
            touch: false,
            lint: false,
            files: vec![],
            directory: None,
            debug: None,
            warnings_as_errors: false,
            log_file: None,
        };
        let resolved = resolve_input_files(&args).unwrap();
        std::env::set_current_dir(prev).unwrap();
        assert_eq!(resolved, vec![dir.path().join("Makefile")]);
    }
}
