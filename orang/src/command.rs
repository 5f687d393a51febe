use tracing::{debug, info};

use crate::config::SearchOptions;
use crate::context::{SearchContext, TerminationReason};
use crate::errors::{SearchError, SearchResult};
use crate::filters::{FileSystemFilter, Filter};
use crate::ops::MatchConsumer;
use crate::pipeline::ResultPipeline;
use crate::results::DirectorySizeMap;
use crate::walk::FileSystemSearch;

/// The verb a command was invoked as. Behaviour lives in the
/// `MatchConsumer` supplied for the verb; the tag is carried for logging
/// and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerb {
    Find,
    Match,
    Replace,
    Rename,
    Delete,
    Copy,
    Move,
    Sync,
}

impl CommandVerb {
    pub fn name(self) -> &'static str {
        match self {
            CommandVerb::Find => "find",
            CommandVerb::Match => "match",
            CommandVerb::Replace => "replace",
            CommandVerb::Rename => "rename",
            CommandVerb::Delete => "delete",
            CommandVerb::Copy => "copy",
            CommandVerb::Move => "move",
            CommandVerb::Sync => "sync",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandOutcome {
    pub matched: bool,
    pub termination: TerminationReason,
    pub telemetry: crate::context::TelemetrySnapshot,
}

impl CommandOutcome {
    /// 0 = at least one match, 1 = no match. Failures map to 2 at the
    /// call site.
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.matched)
    }
}

/// One search-and-operate invocation: filter chain, traversal per root,
/// result pipeline, executor.
pub struct Command<'a> {
    pub verb: CommandVerb,
    pub options: &'a SearchOptions,
    pub filter: &'a FileSystemFilter,
    pub directory_filter: Option<&'a Filter>,
}

impl Command<'_> {
    pub fn execute(
        &self,
        context: &SearchContext,
        consumer: &mut dyn MatchConsumer,
    ) -> SearchResult<CommandOutcome> {
        self.options.validate()?;
        info!("{}: {} root path(s)", self.verb.name(), self.options.paths.len());

        let search = FileSystemSearch {
            filter: self.filter,
            directory_filter: self.directory_filter,
            target: self.options.target,
            recurse: self.options.recurse,
            default_encoding: &self.options.default_encoding,
            context,
        };
        let mut pipeline = ResultPipeline::new(self.options);
        let mut sizes = DirectorySizeMap::new();

        'roots: for root in &self.options.paths {
            debug!("searching {}", root.path.display());
            for item in search.walk(root) {
                pipeline.push(item, consumer, context)?;
                if pipeline.is_full() {
                    break 'roots;
                }
            }
            match context.termination() {
                TerminationReason::None => {}
                _ => break 'roots,
            }
        }

        if let Some(progress) = &context.progress {
            progress.finish();
        }
        if context.termination() == TerminationReason::Canceled {
            // Further operations are skipped; partial progress has already
            // been reported through the telemetry.
            context.log_summary();
            return Err(SearchError::Canceled);
        }

        pipeline.finish(consumer, context, &mut sizes)?;
        consumer.finish(context)?;
        context.log_summary();

        Ok(CommandOutcome {
            matched: context.telemetry.matching_count() > 0,
            termination: context.termination(),
            telemetry: context.telemetry.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchPath;
    use crate::filters::{Filter, PatternOptions};
    use crate::ops::{CollectSink, FindExecutor};
    use std::fs;
    use tempfile::tempdir;

    fn name_filter(pattern: &str) -> FileSystemFilter {
        FileSystemFilter {
            name: Some(Filter::new(pattern, PatternOptions::default()).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn runs_all_roots_in_order_keeping_duplicates() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        fs::write(a.path().join("x.txt"), "").unwrap();
        fs::write(b.path().join("y.txt"), "").unwrap();

        let options = SearchOptions {
            paths: vec![
                SearchPath::argument(a.path()),
                SearchPath::argument(b.path()),
                SearchPath::argument(a.path()),
            ],
            ..Default::default()
        };
        let filter = name_filter(r"\.txt$");
        let command = Command {
            verb: CommandVerb::Find,
            options: &options,
            filter: &filter,
            directory_filter: None,
        };

        let context = SearchContext::new(0, false);
        let mut sink = CollectSink::default();
        let mut consumer = FindExecutor::new(&mut sink, false);
        let outcome = command.execute(&context, &mut consumer).unwrap();

        assert!(outcome.matched);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(sink.lines, vec!["x.txt", "y.txt", "x.txt"]);
    }

    #[test]
    fn no_match_exits_one() {
        let dir = tempdir().unwrap();
        let options = SearchOptions {
            paths: vec![SearchPath::argument(dir.path())],
            ..Default::default()
        };
        let filter = name_filter("nothing-here");
        let command = Command {
            verb: CommandVerb::Find,
            options: &options,
            filter: &filter,
            directory_filter: None,
        };

        let context = SearchContext::new(0, false);
        let mut sink = CollectSink::default();
        let mut consumer = FindExecutor::new(&mut sink, false);
        let outcome = command.execute(&context, &mut consumer).unwrap();

        assert!(!outcome.matched);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[test]
    fn max_reached_is_success() {
        let dir = tempdir().unwrap();
        for i in 0..10 {
            fs::write(dir.path().join(format!("f{i}.log")), "").unwrap();
        }
        let options = SearchOptions {
            paths: vec![SearchPath::argument(dir.path())],
            max_matching_files: 3,
            ..Default::default()
        };
        let filter = name_filter(r"\.log$");
        let command = Command {
            verb: CommandVerb::Find,
            options: &options,
            filter: &filter,
            directory_filter: None,
        };

        let context = SearchContext::new(options.max_matching_files, false);
        let mut sink = CollectSink::default();
        let mut consumer = FindExecutor::new(&mut sink, false);
        let outcome = command.execute(&context, &mut consumer).unwrap();

        assert_eq!(outcome.termination, TerminationReason::MaxReached);
        assert!(outcome.matched);
        assert_eq!(sink.lines.len(), 3);
    }

    #[test]
    fn canceled_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();

        let options = SearchOptions {
            paths: vec![SearchPath::argument(dir.path())],
            ..Default::default()
        };
        let filter = name_filter(r"\.txt$");
        let command = Command {
            verb: CommandVerb::Find,
            options: &options,
            filter: &filter,
            directory_filter: None,
        };

        let context = SearchContext::new(0, false);
        context
            .cancel_handle()
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let mut sink = CollectSink::default();
        let mut consumer = FindExecutor::new(&mut sink, false);
        let err = command.execute(&context, &mut consumer).unwrap_err();
        assert!(matches!(err, SearchError::Canceled));
    }
}
