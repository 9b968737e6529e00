//! Shell/submitter bookkeeping (spec.md §4.1).
//!
//! Everything here is pure or trivially mockable: grammar classification,
//! submission validation, PATH resolution, the shell's private job mirror,
//! and command history. The `shell` binary wires these against real
//! processes, shared memory, and stdio.

use job_table::{DEFAULT_PRIORITY, MAX_PRIORITY};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Shell-side submission failures (spec.md §7 "Submission" kind).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("submit requires a program name")]
    InvalidArgs,
    #[error("{0}: not found or not executable")]
    NotExecutable(String),
    #[error("job table is full")]
    Full,
}

/// Coerce a `submit`-supplied priority argument to a valid priority.
///
/// An absent or unparseable value, or one outside `1..=MAX_PRIORITY`, is
/// non-fatal (spec.md §4.1): it falls back to `DEFAULT_PRIORITY` and warns
/// on stderr rather than rejecting the submission.
pub fn validate_priority(raw: Option<&str>) -> i32 {
    match raw {
        None => DEFAULT_PRIORITY,
        Some(s) => match s.parse::<i32>() {
            Ok(p) if (1..=MAX_PRIORITY).contains(&p) => p,
            Ok(p) => {
                eprintln!("shell: priority {p} out of range 1..={MAX_PRIORITY}, using default {DEFAULT_PRIORITY}");
                DEFAULT_PRIORITY
            }
            Err(_) => {
                eprintln!("shell: priority {s:?} is not a number, using default {DEFAULT_PRIORITY}");
                DEFAULT_PRIORITY
            }
        },
    }
}

/// Abstraction over "is this path an executable file", so PATH resolution
/// can be unit tested without touching the real filesystem. The production
/// implementation delegates to `nix::unistd::access(path, X_OK)`.
pub trait PathProbe {
    fn is_executable(&self, path: &Path) -> bool;
}

/// Resolve `program` against `path_dirs` (an already-split `$PATH`), falling
/// back to a `./program` relative lookup if `program` contains no `/`.
/// Mirrors `simple-shell.c`'s `handle_submit` resolution order: PATH first,
/// current directory last.
pub fn resolve_program(program: &str, path_dirs: &[PathBuf], probe: &dyn PathProbe) -> Option<PathBuf> {
    if program.contains('/') {
        let p = PathBuf::from(program);
        return probe.is_executable(&p).then_some(p);
    }
    for dir in path_dirs {
        let candidate = dir.join(program);
        if probe.is_executable(&candidate) {
            return Some(candidate);
        }
    }
    let local = PathBuf::from(format!("./{program}"));
    probe.is_executable(&local).then_some(local)
}

/// The shell's own private record of a submitted job, kept alongside the
/// shared-memory table (grounded on `simple-shell.c`'s redundant
/// `scheduler_jobs[]` array) so the execution summary can be printed even
/// after the scheduler has exited and the shared segment been destroyed.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorEntry {
    pub pid: i32,
    pub name: String,
    pub priority: i32,
    pub start_time: i64,
    pub completed: bool,
}

/// In-memory mirror of every job this shell has submitted, in submission
/// order. Populated at `submit` time; `completed` is updated as the shell
/// observes completion (via the shared table or, at shutdown, by force).
#[derive(Debug, Default)]
pub struct JobMirror {
    entries: Vec<MirrorEntry>,
}

impl JobMirror {
    pub fn new() -> Self {
        JobMirror { entries: Vec::new() }
    }

    pub fn push(&mut self, pid: i32, name: &str, priority: i32, start_time: i64) {
        self.entries.push(MirrorEntry {
            pid,
            name: name.to_string(),
            priority,
            start_time,
            completed: false,
        });
    }

    pub fn mark_completed(&mut self, pid: i32) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.pid == pid) {
            e.completed = true;
        }
    }

    pub fn entries(&self) -> &[MirrorEntry] {
        &self.entries
    }

    pub fn incomplete_pids(&self) -> Vec<i32> {
        self.entries.iter().filter(|e| !e.completed).map(|e| e.pid).collect()
    }
}

/// Maximum number of remembered commands (grounded on `simple-shell.c`'s
/// `command_history[HISTORY_MAX]`).
pub const HISTORY_MAX: usize = 100;

/// One remembered command line, whether it was `submit`, a pipeline, or a
/// plain external command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLogEntry {
    pub line: String,
    pub pid: Option<i32>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub background: bool,
}

/// A capped command history ring; oldest entries fall off past
/// `HISTORY_MAX`, matching the original's fixed-size array semantics.
#[derive(Debug, Default)]
pub struct History {
    entries: Vec<CommandLogEntry>,
}

impl History {
    pub fn new() -> Self {
        History { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: CommandLogEntry) {
        if self.entries.len() == HISTORY_MAX {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[CommandLogEntry] {
        &self.entries
    }

    /// Render as 1-indexed lines the way `history` prints.
    pub fn render(&self) -> Vec<String> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{:>4}  {}", i + 1, e.line))
            .collect()
    }
}

/// A line of shell input, classified per spec.md §6's grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Submit { program: String, priority_raw: Option<String> },
    Exit,
    History,
    External(ExternalCommand),
    Empty,
}

/// A non-`submit` command line: plain, piped, redirected, and/or
/// backgrounded. `submit` is rejected inside a pipeline, mirroring the
/// original's restriction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCommand {
    pub raw: String,
    pub stages: Vec<String>,
    pub redirect_in: Option<String>,
    pub redirect_out: Option<String>,
    pub background: bool,
}

/// Classify one line of shell input.
///
/// Grammar (spec.md §6): `submit <program> [priority]`, `exit`, `history`,
/// or an external command line optionally piped with `|`, redirected with
/// `<`/`>`, and suffixed with `&` to background it.
pub fn classify_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::Empty;
    }

    let mut words = trimmed.split_whitespace();
    match words.next() {
        Some("submit") => {
            let program = words.next().map(str::to_string);
            let priority_raw = words.next().map(str::to_string);
            return match program {
                Some(program) => ParsedLine::Submit { program, priority_raw },
                None => ParsedLine::Submit { program: String::new(), priority_raw: None },
            };
        }
        Some("exit") => return ParsedLine::Exit,
        Some("history") => return ParsedLine::History,
        _ => {}
    }

    let mut rest = trimmed;
    let background = rest.ends_with('&');
    if background {
        rest = rest[..rest.len() - 1].trim_end();
    }

    let (rest, redirect_out) = split_redirect(rest, '>');
    let (rest, redirect_in) = split_redirect(&rest, '<');

    let stages: Vec<String> = rest.split('|').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();

    ParsedLine::External(ExternalCommand {
        raw: trimmed.to_string(),
        stages,
        redirect_in,
        redirect_out,
        background,
    })
}

fn split_redirect(s: &str, marker: char) -> (String, Option<String>) {
    match s.rfind(marker) {
        Some(idx) => {
            let (head, tail) = s.split_at(idx);
            let target = tail[1..].trim().split_whitespace().next().map(str::to_string);
            (head.trim_end().to_string(), target)
        }
        None => (s.to_string(), None),
    }
}

/// Does this command line require `submit`'s priority argument to be
/// rejected because it's inside a pipeline? The original forbids
/// `submit` as a pipeline stage; this is checked by the caller before
/// ever reaching `classify_line`'s `Submit` branch (a piped `submit ...`
/// simply classifies as `External` with `submit` as its first word,
/// which the shell then refuses to hand to the scheduler).
pub fn is_submit_stage(stage: &str) -> bool {
    stage.split_whitespace().next() == Some("submit")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod priority_validation {
        use super::*;

        #[test]
        fn absent_priority_uses_default() {
            assert_eq!(validate_priority(None), DEFAULT_PRIORITY);
        }

        #[test]
        fn in_range_priority_is_kept() {
            assert_eq!(validate_priority(Some("3")), 3);
        }

        #[test]
        fn out_of_range_falls_back_to_default() {
            assert_eq!(validate_priority(Some("9")), DEFAULT_PRIORITY);
            assert_eq!(validate_priority(Some("0")), DEFAULT_PRIORITY);
        }

        #[test]
        fn unparseable_falls_back_to_default() {
            assert_eq!(validate_priority(Some("high")), DEFAULT_PRIORITY);
        }
    }

    mod path_resolution {
        use super::*;

        struct FakeProbe {
            executables: Vec<PathBuf>,
        }

        impl PathProbe for FakeProbe {
            fn is_executable(&self, path: &Path) -> bool {
                self.executables.iter().any(|p| p == path)
            }
        }

        #[test]
        fn finds_program_on_path() {
            let probe = FakeProbe { executables: vec![PathBuf::from("/usr/bin/spin-job")] };
            let dirs = vec![PathBuf::from("/usr/bin")];
            assert_eq!(resolve_program("spin-job", &dirs, &probe), Some(PathBuf::from("/usr/bin/spin-job")));
        }

        #[test]
        fn falls_back_to_current_directory() {
            let probe = FakeProbe { executables: vec![PathBuf::from("./spin-job")] };
            let dirs = vec![PathBuf::from("/usr/bin")];
            assert_eq!(resolve_program("spin-job", &dirs, &probe), Some(PathBuf::from("./spin-job")));
        }

        #[test]
        fn explicit_path_skips_path_search() {
            let probe = FakeProbe { executables: vec![PathBuf::from("/opt/app/run")] };
            let dirs = vec![PathBuf::from("/usr/bin")];
            assert_eq!(resolve_program("/opt/app/run", &dirs, &probe), Some(PathBuf::from("/opt/app/run")));
        }

        #[test]
        fn not_found_anywhere_is_none() {
            let probe = FakeProbe { executables: vec![] };
            let dirs = vec![PathBuf::from("/usr/bin")];
            assert_eq!(resolve_program("ghost", &dirs, &probe), None);
        }
    }

    mod job_mirror {
        use super::*;

        #[test]
        fn tracks_completion_independently_of_shared_memory() {
            let mut mirror = JobMirror::new();
            mirror.push(10, "alpha", 1, 0);
            mirror.push(11, "beta", 2, 0);
            assert_eq!(mirror.incomplete_pids(), vec![10, 11]);
            mirror.mark_completed(10);
            assert_eq!(mirror.incomplete_pids(), vec![11]);
        }
    }

    mod history {
        use super::*;

        fn entry(line: &str) -> CommandLogEntry {
            CommandLogEntry { line: line.to_string(), pid: None, start_time: 0, end_time: None, background: false }
        }

        #[test]
        fn renders_one_indexed() {
            let mut h = History::new();
            h.push(entry("submit spin-job"));
            h.push(entry("history"));
            let rendered = h.render();
            assert!(rendered[0].trim_start().starts_with("1"));
            assert!(rendered[1].trim_start().starts_with("2"));
        }

        #[test]
        fn caps_at_history_max_dropping_oldest() {
            let mut h = History::new();
            for i in 0..HISTORY_MAX + 5 {
                h.push(entry(&format!("cmd{i}")));
            }
            assert_eq!(h.entries().len(), HISTORY_MAX);
            assert_eq!(h.entries()[0].line, "cmd5");
        }
    }

    mod grammar {
        use super::*;

        #[test]
        fn submit_with_priority() {
            let parsed = classify_line("submit spin-job 3");
            assert_eq!(
                parsed,
                ParsedLine::Submit { program: "spin-job".to_string(), priority_raw: Some("3".to_string()) }
            );
        }

        #[test]
        fn submit_without_priority() {
            let parsed = classify_line("submit spin-job");
            assert_eq!(parsed, ParsedLine::Submit { program: "spin-job".to_string(), priority_raw: None });
        }

        #[test]
        fn exit_and_history_are_recognized() {
            assert_eq!(classify_line("exit"), ParsedLine::Exit);
            assert_eq!(classify_line("history"), ParsedLine::History);
        }

        #[test]
        fn blank_line_is_empty() {
            assert_eq!(classify_line("   "), ParsedLine::Empty);
        }

        #[test]
        fn pipeline_splits_into_stages() {
            let parsed = classify_line("ls -la | grep foo | wc -l");
            match parsed {
                ParsedLine::External(cmd) => {
                    assert_eq!(cmd.stages, vec!["ls -la", "grep foo", "wc -l"]);
                    assert!(!cmd.background);
                }
                other => panic!("expected External, got {other:?}"),
            }
        }

        #[test]
        fn redirection_is_extracted() {
            let parsed = classify_line("sort < input.txt > output.txt");
            match parsed {
                ParsedLine::External(cmd) => {
                    assert_eq!(cmd.redirect_in, Some("input.txt".to_string()));
                    assert_eq!(cmd.redirect_out, Some("output.txt".to_string()));
                    assert_eq!(cmd.stages, vec!["sort"]);
                }
                other => panic!("expected External, got {other:?}"),
            }
        }

        #[test]
        fn trailing_ampersand_marks_background() {
            let parsed = classify_line("sleep 10 &");
            match parsed {
                ParsedLine::External(cmd) => assert!(cmd.background),
                other => panic!("expected External, got {other:?}"),
            }
        }

        #[test]
        fn submit_inside_pipeline_is_rejected_by_caller() {
            let parsed = classify_line("echo hi | submit spin-job");
            match parsed {
                ParsedLine::External(cmd) => {
                    assert_eq!(cmd.stages.len(), 2);
                    assert!(is_submit_stage(&cmd.stages[1]));
                }
                other => panic!("expected External, got {other:?}"),
            }
        }
    }
}
