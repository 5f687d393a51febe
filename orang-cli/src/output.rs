use std::fs::{File, OpenOptions};
use std::io::{IsTerminal, Write};
use std::path::Path;

use colored::Colorize;
use orang::ops::OutputSink;
use orang::{SearchError, SearchResult};

/// Writes primary output to stdout, colouring operation prefixes, and
/// optionally tees every line into a file given as
/// `FILE[,VERBOSITY[,ENCODING[,append]]]`.
pub struct ConsoleSink {
    color: bool,
    tee: Option<File>,
}

impl ConsoleSink {
    pub fn new(highlight: bool, output_spec: Option<&str>) -> SearchResult<Self> {
        let color = highlight
            && std::io::stdout().is_terminal()
            && std::env::var_os("NO_COLOR").is_none();
        if !color {
            colored::control::set_override(false);
        }

        let tee = match output_spec {
            Some(spec) => Some(Self::open_tee(spec)?),
            None => None,
        };
        Ok(Self { color, tee })
    }

    fn open_tee(spec: &str) -> SearchResult<File> {
        let mut parts = spec.split(',').map(str::trim);
        let path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SearchError::config_error("--output requires a file name"))?;
        let append = parts.any(|p| p.eq_ignore_ascii_case("append"));

        let mut options = OpenOptions::new();
        options.create(true).write(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        options
            .open(path)
            .map_err(|e| SearchError::write_failed(Path::new(path), e))
    }

    fn colorize(&self, text: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        let Some((prefix, rest)) = text.split_once(' ') else {
            return text.to_string();
        };
        let painted = match prefix {
            "ADD" => prefix.green(),
            "UPD" => prefix.cyan(),
            "DEL" => prefix.red(),
            "REN" => prefix.yellow(),
            "ERR" => prefix.red().bold(),
            _ => return text.to_string(),
        };
        format!("{painted} {rest}")
    }
}

impl OutputSink for ConsoleSink {
    fn line(&mut self, text: &str) {
        println!("{}", self.colorize(text));
        if let Some(tee) = &mut self.tee {
            let _ = writeln!(tee, "{text}");
        }
    }
}
