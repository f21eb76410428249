//! Command-line options.
//!
//! Recognized forms: `--category.name=value`, `--help`, and for declared
//! options `-s value` or `-svalue` shortcuts. Values use the same syntax as
//! the config file; anything that is not valid value syntax is taken as a
//! bare string. Positional arguments are preserved in order in the
//! remainder.

use std::fmt::Write as _;

use crate::error::{Error, ErrorCode, Result};

use super::parser::parse_value_str;
use super::value::{ConfigValue, Settings};

/// One declared option.
#[derive(Debug, Clone)]
pub struct OptionDecl {
    /// Dotted settings path, e.g. `scheduler.max-threads`.
    pub path: String,
    pub short: Option<char>,
    pub help: String,
}

/// The declared option table of a program.
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    decls: Vec<OptionDecl>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an option; `short` enables the `-s value` form.
    pub fn add(mut self, path: &str, short: Option<char>, help: &str) -> Self {
        self.decls.push(OptionDecl {
            path: path.to_string(),
            short,
            help: help.to_string(),
        });
        self
    }

    /// The option table rendered for `--help`.
    pub fn help_text(&self, program: &str) -> String {
        let mut out = format!("usage: {program} [options] [args...]\n\noptions:\n");
        let _ = writeln!(out, "  --help{:18}print this text", "");
        for decl in &self.decls {
            let short = decl
                .short
                .map(|c| format!("-{c}, "))
                .unwrap_or_default();
            let left = format!("{short}--{}=<value>", decl.path);
            let _ = writeln!(out, "  {left:<28}{}", decl.help);
        }
        out
    }

    fn by_short(&self, short: char) -> Option<&OptionDecl> {
        self.decls.iter().find(|d| d.short == Some(short))
    }

    /// Parses arguments (without the program name). CLI values land in the
    /// returned settings; apply them on top of file settings to give the
    /// command line precedence.
    pub fn parse<I>(&self, args: I) -> Result<CliArgs>
    where
        I: IntoIterator<Item = String>,
    {
        let mut settings = Settings::new();
        let mut remainder = Vec::new();
        let mut help_requested = false;
        let mut args = args.into_iter().peekable();
        while let Some(arg) = args.next() {
            if arg == "--help" {
                help_requested = true;
            } else if let Some(long) = arg.strip_prefix("--") {
                let (path, raw) = long.split_once('=').ok_or_else(|| {
                    Error::with_message(
                        ErrorCode::InvalidArgument,
                        format!("option '--{long}' is missing '=<value>'"),
                    )
                })?;
                settings.put(path, interpret(raw));
            } else if let Some(short) = arg.strip_prefix('-').filter(|s| !s.is_empty()) {
                let mut chars = short.chars();
                let letter = chars.next().unwrap_or_default();
                let decl = self.by_short(letter).ok_or_else(|| {
                    Error::with_message(
                        ErrorCode::InvalidArgument,
                        format!("unknown option '-{letter}'"),
                    )
                })?;
                let attached: String = chars.collect();
                let raw = if attached.is_empty() {
                    args.next().ok_or_else(|| {
                        Error::with_message(
                            ErrorCode::InvalidArgument,
                            format!("option '-{letter}' expects a value"),
                        )
                    })?
                } else {
                    attached
                };
                settings.put(&decl.path, interpret(&raw));
            } else {
                remainder.push(arg);
            }
        }
        Ok(CliArgs {
            settings,
            remainder,
            help_requested,
        })
    }
}

/// Result of a CLI parse.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub settings: Settings,
    /// Positional arguments, in their original order.
    pub remainder: Vec<String>,
    pub help_requested: bool,
}

/// Typed value syntax when it parses, bare string otherwise.
fn interpret(raw: &str) -> ConfigValue {
    parse_value_str(raw).unwrap_or_else(|_| ConfigValue::String(raw.to_string()))
}
