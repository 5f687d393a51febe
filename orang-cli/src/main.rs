use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use orang::ops::{
    ConflictOption, DeleteExecutor, FindExecutor, MatchConsumer, MatchExecutor, OutputSink,
    RenameExecutor, ReplaceExecutor, TransferExecutor,
};
use orang::{
    AppConfig, Command, CommandOutcome, CommandVerb, CompareOptions, ConflictPrompt,
    ConflictResolution, FileAttributes, FileEmptyOption, FilePropertyFilter, FileSystemFilter,
    Filter, NamePart, PatternOptions, PropertyPredicate, SearchContext, SearchError, SearchItem,
    SearchOptions, SearchPath, SearchResult, SearchTarget, SortDescriptor, Synchronizer,
    TerminationReason,
};

mod diff;
mod output;
mod prompt;

use output::ConsoleSink;
use prompt::TerminalPrompt;

#[derive(Parser)]
#[command(
    name = "orang",
    version,
    about = "Search, replace, rename, copy, move, delete and synchronize files with regular expressions"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonOpts {
    /// Regex applied to the configured name part
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Regex applied to the extension
    #[arg(short = 'e', long)]
    extension: Option<String>,

    /// Regex applied to the decoded file content
    #[arg(short = 'c', long)]
    content: Option<String>,

    /// Directory names must match this regex for the walk to descend
    #[arg(long = "directory-filter")]
    directory_filter: Option<String>,

    /// Name part the name filter sees (name|name-without-extension|extension|full-name)
    #[arg(long, default_value = "name")]
    part: String,

    /// Capture group of the content pattern to report
    #[arg(short = 'g', long)]
    group: Option<String>,

    /// Case-insensitive matching
    #[arg(short = 'i', long = "ignore-case")]
    ignore_case: bool,

    /// `^` and `$` match at line boundaries
    #[arg(long)]
    multiline: bool,

    /// `.` matches newline
    #[arg(long)]
    singleline: bool,

    /// Invert a filter; repeatable (name|extension|content|directory)
    #[arg(long = "negate", value_name = "FILTER")]
    negate: Vec<String>,

    /// Attributes a match must carry, e.g. hidden,read-only
    #[arg(short = 'a', long)]
    attributes: Option<String>,

    /// Attributes that disqualify a match
    #[arg(short = 'A', long = "attributes-to-skip")]
    attributes_to_skip: Option<String>,

    /// Size predicate, e.g. '>10kb'
    #[arg(long)]
    size: Option<String>,

    /// Modified-time predicate, e.g. '>=2024-01-01'
    #[arg(long)]
    modified: Option<String>,

    /// Creation-time predicate
    #[arg(long)]
    created: Option<String>,

    /// Match empty or non-empty items only (any|empty|non-empty)
    #[arg(long, default_value = "any")]
    empty: String,

    /// What to match (files|directories|all)
    #[arg(long = "type", default_value = "files")]
    target_kind: String,

    /// Recurse into subdirectories
    #[arg(short = 'r', long)]
    recurse: bool,

    /// Sort descriptors, e.g. 'name,size:desc'
    #[arg(short = 's', long)]
    sort: Option<String>,

    /// Cap on displayed results (0 = unlimited)
    #[arg(long = "max-count", default_value_t = 0)]
    max_count: usize,

    /// Stop after this many matches (0 = unlimited)
    #[arg(long = "max-matching-files", default_value_t = 0)]
    max_matching_files: u64,

    /// Encoding applied when no BOM is present (default utf-8)
    #[arg(long)]
    encoding: Option<String>,

    /// Report without changing the filesystem
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Print the end-of-command summary
    #[arg(long = "include-summary")]
    include_summary: bool,

    /// Show live progress
    #[arg(long)]
    progress: bool,

    /// Verbosity (q|m|n|d|diag)
    #[arg(short = 'v', long, default_value = "n")]
    verbosity: String,

    /// Tee output into FILE[,VERBOSITY[,ENCODING[,append]]]
    #[arg(long)]
    output: Option<String>,

    /// Highlighted parts (match|none)
    #[arg(long, default_value = "match")]
    highlight: String,

    /// Extra display columns (size)
    #[arg(long)]
    display: Option<String>,

    /// Paths to search; defaults to the current directory
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for files and directories
    Find(CommonOpts),
    /// List every content match
    Match(CommonOpts),
    /// Replace content matches
    Replace {
        #[command(flatten)]
        common: CommonOpts,
        /// Replacement template; supports $1 and $name references
        #[arg(short = 't', long)]
        replacement: String,
    },
    /// Rename matched files and directories
    Rename {
        #[command(flatten)]
        common: CommonOpts,
        /// Replacement template applied to the name
        #[arg(short = 't', long)]
        replacement: String,
    },
    /// Delete matched files and directories
    Delete {
        #[command(flatten)]
        common: CommonOpts,
        /// Allow deleting directories with their contents
        #[arg(long)]
        recursive: bool,
    },
    /// Copy matches into a target directory
    Copy {
        #[command(flatten)]
        common: CommonOpts,
        /// Destination directory
        #[arg(long)]
        target: PathBuf,
        /// Behaviour on existing targets (fail|overwrite|skip)
        #[arg(long, default_value = "fail")]
        conflict: String,
    },
    /// Move matches into a target directory
    Move {
        #[command(flatten)]
        common: CommonOpts,
        #[arg(long)]
        target: PathBuf,
        #[arg(long, default_value = "fail")]
        conflict: String,
    },
    /// Synchronize two directories
    Sync {
        #[command(flatten)]
        common: CommonOpts,
        /// The other directory
        #[arg(long)]
        right: PathBuf,
        /// Conflict policy (left-wins|right-wins|ask)
        #[arg(long, default_value = "ask")]
        conflict: String,
        /// Equality criteria (attributes,content,modified-time,size)
        #[arg(long, default_value = "modified-time,size")]
        compare: String,
    },
    /// Escape regex metacharacters in the input (or stdin)
    Escape { input: Option<String> },
    /// Print matched file content split at the content pattern
    Split(CommonOpts),
    /// Show a short regular-expression syntax reference
    ListPatterns,
}

impl Commands {
    fn common(&self) -> Option<&CommonOpts> {
        match self {
            Commands::Find(c) | Commands::Match(c) | Commands::Split(c) => Some(c),
            Commands::Replace { common, .. }
            | Commands::Rename { common, .. }
            | Commands::Delete { common, .. }
            | Commands::Copy { common, .. }
            | Commands::Move { common, .. }
            | Commands::Sync { common, .. } => Some(common),
            Commands::Escape { .. } | Commands::ListPatterns => None,
        }
    }
}

/// Everything the core needs, built once from the parsed arguments and
/// frozen for the command's lifetime.
struct Built {
    options: SearchOptions,
    filter: FileSystemFilter,
    directory_filter: Option<Filter>,
}

fn pattern_options(common: &CommonOpts) -> PatternOptions {
    PatternOptions {
        ignore_case: common.ignore_case,
        multiline: common.multiline,
        singleline: common.singleline,
        ..Default::default()
    }
}

fn build(common: &CommonOpts) -> SearchResult<Built> {
    let options = pattern_options(common);
    for what in &common.negate {
        if !matches!(what.as_str(), "name" | "extension" | "content" | "directory") {
            return Err(SearchError::unknown_enum("negate", what.clone()));
        }
    }
    let negated = |what: &str| common.negate.iter().any(|n| n == what);

    let name = match &common.name {
        Some(pattern) => Some(
            Filter::new(pattern, options)?
                .negated(negated("name"))
                .for_part(NamePart::parse(&common.part)?),
        ),
        None => None,
    };
    let extension = match &common.extension {
        Some(pattern) => Some(
            Filter::new(pattern, options)?
                .negated(negated("extension"))
                .for_part(NamePart::Extension),
        ),
        None => None,
    };
    let content = match &common.content {
        Some(pattern) => {
            let mut filter = Filter::new(pattern, options)?.negated(negated("content"));
            if let Some(group) = &common.group {
                filter = filter.with_group(group)?;
            }
            Some(filter)
        }
        None => None,
    };
    let directory_filter = match &common.directory_filter {
        Some(pattern) => Some(Filter::new(pattern, options)?.negated(negated("directory"))),
        None => None,
    };

    let properties = FilePropertyFilter {
        size: common
            .size
            .as_deref()
            .map(PropertyPredicate::parse_size)
            .transpose()?,
        modified_time: common
            .modified
            .as_deref()
            .map(PropertyPredicate::parse_time)
            .transpose()?,
        creation_time: common
            .created
            .as_deref()
            .map(PropertyPredicate::parse_time)
            .transpose()?,
    };

    let filter = FileSystemFilter {
        name,
        extension,
        content,
        attributes: common
            .attributes
            .as_deref()
            .map(FileAttributes::parse_list)
            .transpose()?
            .unwrap_or_default(),
        attributes_to_skip: common
            .attributes_to_skip
            .as_deref()
            .map(FileAttributes::parse_list)
            .transpose()?
            .unwrap_or_default(),
        empty: FileEmptyOption::parse(&common.empty)?,
        properties,
    };

    let paths = if common.paths.is_empty() {
        vec![SearchPath::current_directory()]
    } else {
        common.paths.iter().map(SearchPath::argument).collect()
    };

    let mut search_options = SearchOptions {
        paths,
        target: SearchTarget::parse(&common.target_kind)?,
        recurse: common.recurse,
        max_count: common.max_count,
        max_matching_files: common.max_matching_files,
        sort: common
            .sort
            .as_deref()
            .map(SortDescriptor::parse_list)
            .transpose()?
            .unwrap_or_default(),
        default_encoding: common
            .encoding
            .clone()
            .unwrap_or_else(|| "utf-8".to_string()),
        dry_run: common.dry_run,
        include_summary: common.include_summary,
        progress: common.progress,
        display_columns: common
            .display
            .as_deref()
            .is_some_and(|d| d.split(',').any(|p| p.trim() == "size")),
    };
    AppConfig::load()?.apply_to(&mut search_options, common.encoding.is_some());
    search_options.validate()?;

    Ok(Built {
        options: search_options,
        filter,
        directory_filter,
    })
}

fn init_tracing(verbosity: &str) -> SearchResult<()> {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        "q" | "quiet" => LevelFilter::OFF,
        "m" | "minimal" => LevelFilter::ERROR,
        "n" | "normal" => LevelFilter::WARN,
        "d" | "detailed" => LevelFilter::DEBUG,
        "diag" | "diagnostic" => LevelFilter::TRACE,
        other => return Err(SearchError::unknown_enum("verbosity", other)),
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn print_summary(sink: &mut dyn OutputSink, context: &SearchContext) {
    let s = context.telemetry.snapshot();
    sink.line(&format!(
        "Matches: {}  Files: {}  Directories: {}  Errors: {}",
        s.matching_count(),
        s.file_count,
        s.directory_count,
        s.error_count,
    ));
    if s.added_count + s.updated_count + s.deleted_count + s.renamed_count > 0 {
        sink.line(&format!(
            "Added: {}  Updated: {}  Deleted: {}  Renamed: {}",
            s.added_count, s.updated_count, s.deleted_count, s.renamed_count,
        ));
    }
    sink.line(&format!("Elapsed: {:.2?}", context.elapsed()));
}

/// Prints each matched file's content split at the content pattern.
struct SplitExecutor<'a> {
    sink: &'a mut dyn OutputSink,
    filter: Filter,
}

impl MatchConsumer for SplitExecutor<'_> {
    fn consume(&mut self, item: &SearchItem, _context: &SearchContext) -> SearchResult<()> {
        let Some(content) = &item.file_match.content else {
            return Ok(());
        };
        let path = item.relative_path().display().to_string();
        for (index, piece) in self.filter.regex().split(content).enumerate() {
            self.sink.line(&format!("{path}:{}: {piece}", index + 1));
        }
        Ok(())
    }
}

fn execute(
    verb: CommandVerb,
    built: &Built,
    context: &SearchContext,
    consumer: &mut dyn MatchConsumer,
) -> SearchResult<CommandOutcome> {
    let command = Command {
        verb,
        options: &built.options,
        filter: &built.filter,
        directory_filter: built.directory_filter.as_ref(),
    };
    command.execute(context, consumer)
}

fn require_content(built: &Built, verb: &str) -> SearchResult<Filter> {
    built
        .filter
        .content
        .clone()
        .ok_or_else(|| SearchError::config_error(format!("{verb} requires --content")))
}

fn run() -> SearchResult<i32> {
    let cli = Cli::parse();

    let verbosity = cli
        .command
        .common()
        .map(|c| c.verbosity.clone())
        .unwrap_or_else(|| "n".to_string());
    init_tracing(&verbosity)?;

    // Verbs without a search phase.
    match &cli.command {
        Commands::Escape { input } => {
            let text = match input {
                Some(text) => text.clone(),
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .map_err(SearchError::from)?;
                    buffer
                }
            };
            println!("{}", regex::escape(text.trim_end_matches('\n')));
            return Ok(0);
        }
        Commands::ListPatterns => {
            for (pattern, description) in PATTERN_REFERENCE {
                println!("{pattern:<12} {description}");
            }
            return Ok(0);
        }
        _ => {}
    }

    let common = cli.command.common().expect("search verbs carry options");
    let built = build(common)?;
    let context = SearchContext::new(built.options.max_matching_files, built.options.progress);
    let mut sink = ConsoleSink::new(common.highlight != "none", common.output.as_deref())?;

    let code = match &cli.command {
        Commands::Find(_) => {
            let mut consumer = FindExecutor::new(&mut sink, built.options.display_columns);
            execute(CommandVerb::Find, &built, &context, &mut consumer)?.exit_code()
        }
        Commands::Match(_) => {
            let filter = require_content(&built, "match")?;
            let mut consumer = MatchExecutor {
                sink: &mut sink,
                filter,
            };
            execute(CommandVerb::Match, &built, &context, &mut consumer)?.exit_code()
        }
        Commands::Split(_) => {
            let filter = require_content(&built, "split")?;
            let mut consumer = SplitExecutor {
                sink: &mut sink,
                filter,
            };
            execute(CommandVerb::Match, &built, &context, &mut consumer)?.exit_code()
        }
        Commands::Replace { replacement, .. } => {
            let filter = require_content(&built, "replace")?;
            let dry_run = built.options.dry_run;
            let mut consumer = ReplaceExecutor {
                sink: &mut sink,
                filter,
                template: replacement.clone(),
                default_encoding: built.options.default_encoding.clone(),
                dry_run,
                preview: dry_run.then(|| {
                    Box::new(|path: &std::path::Path, old: &str, new: &str| {
                        print!("{}", diff::unified_diff(path, old, new));
                    }) as Box<dyn FnMut(&std::path::Path, &str, &str)>
                }),
            };
            execute(CommandVerb::Replace, &built, &context, &mut consumer)?.exit_code()
        }
        Commands::Rename { replacement, .. } => {
            let filter = built.filter.name.clone().ok_or_else(|| {
                SearchError::config_error("rename requires --name")
            })?;
            let mut consumer = RenameExecutor {
                sink: &mut sink,
                filter,
                template: replacement.clone(),
                dry_run: built.options.dry_run,
            };
            execute(CommandVerb::Rename, &built, &context, &mut consumer)?.exit_code()
        }
        Commands::Delete { recursive, .. } => {
            let mut consumer = DeleteExecutor {
                sink: &mut sink,
                recursive: *recursive,
                dry_run: built.options.dry_run,
            };
            execute(CommandVerb::Delete, &built, &context, &mut consumer)?.exit_code()
        }
        Commands::Copy {
            target, conflict, ..
        }
        | Commands::Move {
            target, conflict, ..
        } => {
            let remove_source = matches!(&cli.command, Commands::Move { .. });
            let verb = if remove_source {
                CommandVerb::Move
            } else {
                CommandVerb::Copy
            };
            let mut consumer = TransferExecutor {
                sink: &mut sink,
                destination: target.clone(),
                conflict: ConflictOption::parse(conflict)?,
                remove_source,
                dry_run: built.options.dry_run,
            };
            execute(verb, &built, &context, &mut consumer)?.exit_code()
        }
        Commands::Sync {
            right,
            conflict,
            compare,
            ..
        } => {
            let conflict = ConflictResolution::parse(conflict)?;
            let compare = CompareOptions::parse_list(compare)?;
            let left = built
                .options
                .paths
                .first()
                .map(|p| p.path.clone())
                .expect("validated non-empty");

            let mut terminal_prompt = TerminalPrompt;
            let prompt: Option<&mut dyn ConflictPrompt> = match conflict {
                ConflictResolution::Ask => Some(&mut terminal_prompt),
                _ => None,
            };
            {
                let mut sync = Synchronizer::new(
                    &built.filter,
                    built.directory_filter.as_ref(),
                    &built.options.default_encoding,
                    compare,
                    conflict,
                    built.options.dry_run,
                    &context,
                    &mut sink,
                    prompt,
                );
                sync.synchronize(&left, right)?;
            }
            if context.termination() == TerminationReason::Canceled {
                return Err(SearchError::Canceled);
            }
            i32::from(context.telemetry.matching_count() == 0)
        }
        Commands::Escape { .. } | Commands::ListPatterns => unreachable!("handled above"),
    };

    if built.options.include_summary {
        print_summary(&mut sink, &context);
    }
    Ok(code)
}

const PATTERN_REFERENCE: &[(&str, &str)] = &[
    (".", "any character except newline"),
    ("\\d", "decimal digit"),
    ("\\w", "word character"),
    ("\\s", "whitespace"),
    ("\\b", "word boundary"),
    ("^", "start of input (or line with --multiline)"),
    ("$", "end of input (or line with --multiline)"),
    ("[abc]", "character class"),
    ("[^abc]", "negated character class"),
    ("a|b", "alternation"),
    ("(x)", "capture group"),
    ("(?P<n>x)", "named capture group"),
    ("x*", "zero or more"),
    ("x+", "one or more"),
    ("x?", "zero or one"),
    ("x{m,n}", "between m and n repetitions"),
];

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("orang: {e}");
            ExitCode::from(2)
        }
    }
}
