// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collaborators supplying stack frames and allocation counts.

use regex::Regex;
use std::backtrace::Backtrace;
use std::fmt;
use std::path::Path;

/// Frames kept from the application's own code.
pub const APP_FRAMES: usize = 8;

/// Supplies the current call stack on demand, innermost frame first.
pub trait BacktraceSource: Send + Sync + fmt::Debug {
    fn capture(&self) -> Vec<String>;
}

/// Captures frames with [`std::backtrace::Backtrace`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StdBacktraceSource;

impl BacktraceSource for StdBacktraceSource {
    fn capture(&self) -> Vec<String> {
        let rendered = Backtrace::force_capture().to_string();
        frames_from_rendered(&rendered)
    }
}

/// Turn the rendered form (`N: symbol` followed by `at file:line:col`) into
/// one string per frame, preferring the source location.
fn frames_from_rendered(rendered: &str) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    for line in rendered.lines().map(str::trim) {
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(last) = frames.last_mut() {
                *last = location.to_owned();
            }
        } else if let Some((index, symbol)) = line.split_once(": ") {
            if index.chars().all(|c| c.is_ascii_digit()) {
                frames.push(symbol.to_owned());
            }
        }
    }
    frames
}

/// Reports the process-wide allocation count, when the host tracks one.
pub trait AllocationSource: Send + Sync + fmt::Debug {
    fn allocations(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAllocationSource;

impl AllocationSource for NoopAllocationSource {
    fn allocations(&self) -> u64 {
        0
    }
}

/// Keeps the first [`APP_FRAMES`] frames located under the application's
/// `lib/`, `app/`, `config/` or `src/` directories, relative to its root.
#[derive(Debug, Clone)]
pub struct BacktraceParser {
    app_dir: Regex,
}

impl BacktraceParser {
    pub fn new(root: &Path) -> Result<Self, regex::Error> {
        let root = root.to_string_lossy();
        let root = root.trim_end_matches('/');
        let app_dir = Regex::new(&format!(
            "{}/((?:lib/|app/|config/|src/).*)",
            regex::escape(root)
        ))?;
        Ok(Self { app_dir })
    }

    #[must_use]
    pub fn parse(&self, call_stack: &[String]) -> Vec<String> {
        call_stack
            .iter()
            .filter_map(|frame| {
                self.app_dir
                    .captures(frame)
                    .and_then(|caps| caps.get(1))
                    .map(|relative| relative.as_str().to_owned())
            })
            .take(APP_FRAMES)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/Users/deploy/secret-next-big-thing/current";

    fn raw_backtrace(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!("{ROOT}/app/controllers/best_{i}_controller.rb"))
            .collect()
    }

    fn parser(root: &str) -> BacktraceParser {
        BacktraceParser::new(Path::new(root)).expect("valid regex")
    }

    #[test]
    fn test_maxes_at_app_frames() {
        assert_eq!(parser(ROOT).parse(&raw_backtrace(10)).len(), APP_FRAMES);
    }

    #[test]
    fn test_trims_root_and_keeps_order() {
        let result = parser(ROOT).parse(&raw_backtrace(3));
        assert_eq!(
            result,
            vec![
                "app/controllers/best_0_controller.rb",
                "app/controllers/best_1_controller.rb",
                "app/controllers/best_2_controller.rb",
            ]
        );
    }

    #[test]
    fn test_works_with_no_in_app_frames() {
        assert!(parser("/Users/deploy/different-secrets")
            .parse(&raw_backtrace(10))
            .is_empty());
    }

    #[test]
    fn test_excludes_vendor_paths() {
        let frames = vec![
            format!("{ROOT}/vendor/ruby/thing.rb"),
            format!("{ROOT}/app/controllers/users_controller.rb"),
            format!("{ROOT}/vendor/ruby/thing.rb"),
            format!("{ROOT}/config/initializers/foo.rb"),
        ];
        assert_eq!(
            parser(ROOT).parse(&frames),
            vec![
                "app/controllers/users_controller.rb",
                "config/initializers/foo.rb"
            ]
        );
    }

    #[test]
    fn test_root_with_regex_characters() {
        let root = "/srv/app (1)+";
        let frames = vec![format!("{root}/src/main.rs:10:5")];
        assert_eq!(parser(root).parse(&frames), vec!["src/main.rs:10:5"]);
    }

    #[test]
    fn test_frames_from_rendered() {
        let rendered = "   0: apm_tracker::work\n             at ./src/lib.rs:10:5\n   1: std::rt::lang_start\n";
        assert_eq!(
            frames_from_rendered(rendered),
            vec!["./src/lib.rs:10:5", "std::rt::lang_start"]
        );
    }

    #[test]
    fn test_std_source_captures_frames() {
        assert!(!StdBacktraceSource.capture().is_empty());
    }
}
