//! Puppetfile interpreter.
//!
//! Understands the declarative subset of the Puppetfile language that
//! module lists are written in:
//!
//! ```text
//! forge "https://forge.puppet.com"
//!
//! mod "puppetlabs-stdlib", "9.4.1"
//! mod "acme-site",
//!   :git => "https://git.example.com/site.git",
//!   :tag => "v2.1"
//! mod "acme-web", git: "https://git.example.com/web.git", branch: "next"
//! ```
//!
//! A statement continues onto the next line after a trailing `,` or `=>`.

use crate::environments::validate_module_name;
use crate::error::{Error, Result};
use crate::repo::{CANONICAL_FORGE_URL, normalize_forge_url};
use std::fs;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;

/// Reference used for git modules that name none.
pub const DEFAULT_GIT_REF: &str = "refs/heads/master";

/// Where a module comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    Git {
        url: String,
        reference: String,
    },
    Forge {
        forge_url: String,
        /// `author-name`
        full_name: String,
        /// A release version or `latest`.
        version: String,
    },
}

/// One `mod` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    /// Directory name under `modules/`.
    pub name: String,
    pub source: ModuleSource,
}

/// The modules declared by a Puppetfile, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    modules: Vec<ModuleSpec>,
}

impl Manifest {
    /// Read and interpret a Puppetfile.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    /// Interpret Puppetfile source. `path` is only used in error messages.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let mut parser = Parser {
            path: path.to_path_buf(),
            forge_url: CANONICAL_FORGE_URL.to_string(),
            modules: Vec::new(),
        };
        for statement in split_statements(tokenize(content, path)?) {
            parser.statement(&statement)?;
        }
        Ok(Self {
            modules: parser.modules,
        })
    }

    pub fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }

    pub fn get(&self, name: &str) -> Option<&ModuleSpec> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Str(String),
    Symbol(String),
    /// `key:` in keyword-argument style.
    Label(String),
    Arrow,
    Comma,
    Newline,
}

#[derive(Debug, Clone)]
struct Lexed {
    token: Token,
    line: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn take_ident(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut ident = String::new();
    while let Some(c) = chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
        ident.push(c);
    }
    ident
}

fn tokenize(content: &str, path: &Path) -> Result<Vec<Lexed>> {
    let mut tokens = Vec::new();
    let mut chars = content.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        let token = match c {
            '\n' => {
                tokens.push(Lexed {
                    token: Token::Newline,
                    line,
                });
                line += 1;
                continue;
            }
            c if c.is_whitespace() => continue,
            '#' => {
                while chars.next_if(|c| *c != '\n').is_some() {}
                continue;
            }
            ',' => Token::Comma,
            '=' => {
                if chars.next_if_eq(&'>').is_none() {
                    return Err(Error::manifest(path, line, "expected '=>'"));
                }
                Token::Arrow
            }
            '"' | '\'' => {
                let start = line;
                let mut value = String::new();
                loop {
                    match chars.next() {
                        None => return Err(Error::manifest(path, start, "unterminated string")),
                        Some(q) if q == c => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(Error::manifest(path, start, "unterminated string")),
                        },
                        Some('\n') => {
                            line += 1;
                            value.push('\n');
                        }
                        Some(other) => value.push(other),
                    }
                }
                tokens.push(Lexed {
                    token: Token::Str(value),
                    line: start,
                });
                continue;
            }
            ':' => {
                let name = take_ident(&mut chars);
                if name.is_empty() {
                    return Err(Error::manifest(path, line, "expected a symbol after ':'"));
                }
                Token::Symbol(name)
            }
            c if is_ident_start(c) => {
                let mut name = c.to_string();
                name.push_str(&take_ident(&mut chars));
                if chars.next_if_eq(&':').is_some() {
                    Token::Label(name)
                } else {
                    Token::Word(name)
                }
            }
            other => {
                return Err(Error::manifest(path, line, format!("unexpected character '{other}'")));
            }
        };
        tokens.push(Lexed { token, line });
    }
    Ok(tokens)
}

fn split_statements(tokens: Vec<Lexed>) -> Vec<Vec<Lexed>> {
    let mut statements = Vec::new();
    let mut current: Vec<Lexed> = Vec::new();
    for lexed in tokens {
        if lexed.token == Token::Newline {
            let continues = matches!(
                current.last().map(|l| &l.token),
                Some(Token::Comma | Token::Arrow)
            );
            if !continues && !current.is_empty() {
                statements.push(std::mem::take(&mut current));
            }
        } else {
            current.push(lexed);
        }
    }
    if !current.is_empty() {
        statements.push(current);
    }
    statements
}

#[derive(Debug)]
enum Arg {
    Positional(String),
    Option(String, String),
}

struct Parser {
    path: PathBuf,
    forge_url: String,
    modules: Vec<ModuleSpec>,
}

impl Parser {
    fn error(&self, line: usize, message: impl Into<String>) -> Error {
        Error::manifest(&self.path, line, message)
    }

    fn statement(&mut self, tokens: &[Lexed]) -> Result<()> {
        let line = tokens[0].line;
        let Token::Word(command) = &tokens[0].token else {
            return Err(self.error(line, "expected a command"));
        };
        let args = self.args(&tokens[1..])?;

        match command.as_str() {
            "forge" => match args.as_slice() {
                [Arg::Positional(url)] => {
                    self.forge_url = normalize_forge_url(url);
                    Ok(())
                }
                _ => Err(self.error(line, "forge takes exactly one URL")),
            },
            "mod" => self.module(args, line),
            other => Err(self.error(line, format!("unknown command '{other}'"))),
        }
    }

    fn args(&self, tokens: &[Lexed]) -> Result<Vec<Arg>> {
        let mut args = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let line = tokens[i].line;
            let next = |offset: usize| tokens.get(i + offset).map(|l| &l.token);
            let (arg, used) = match (next(0), next(1), next(2)) {
                (
                    Some(Token::Symbol(key) | Token::Str(key)),
                    Some(Token::Arrow),
                    Some(Token::Str(value) | Token::Symbol(value)),
                ) => (Arg::Option(key.clone(), value.clone()), 3),
                (Some(Token::Label(key)), Some(Token::Str(value) | Token::Symbol(value)), _) => {
                    (Arg::Option(key.clone(), value.clone()), 2)
                }
                (Some(Token::Str(value)), _, _) => (Arg::Positional(value.clone()), 1),
                _ => return Err(self.error(line, "expected a string or an option")),
            };
            args.push(arg);
            i += used;

            match tokens.get(i) {
                None => break,
                Some(Lexed {
                    token: Token::Comma, ..
                }) if i + 1 < tokens.len() => i += 1,
                Some(lexed) => return Err(self.error(lexed.line, "expected ',' between arguments")),
            }
        }
        Ok(args)
    }

    fn module(&mut self, args: Vec<Arg>, line: usize) -> Result<()> {
        let mut positional = Vec::new();
        let mut options: Vec<(String, String)> = Vec::new();
        for arg in args {
            match arg {
                Arg::Positional(value) if options.is_empty() => positional.push(value),
                Arg::Positional(_) => {
                    return Err(self.error(line, "positional argument after options"));
                }
                Arg::Option(key, value) => {
                    if options.iter().any(|(k, _)| *k == key) {
                        return Err(self.error(line, format!("option :{key} given twice")));
                    }
                    options.push((key, value));
                }
            }
        }

        let full_name = match positional.as_slice() {
            [full_name] | [full_name, _] => full_name.clone(),
            [] => return Err(self.error(line, "mod needs a module name")),
            _ => return Err(self.error(line, "mod takes a name and at most one version")),
        };
        let name = short_name(&full_name).to_string();
        validate_module_name(&name).map_err(|e| self.error(line, e.to_string()))?;
        if self.modules.iter().any(|m| m.name == name) {
            return Err(self.error(line, format!("Module {name} declared twice")));
        }

        let mut git = None;
        let mut reference = None;
        for (key, value) in options {
            let resolved = match key.as_str() {
                "git" => {
                    git = Some(value);
                    continue;
                }
                "commit" | "ref" => value,
                "tag" => format!("refs/tags/{value}"),
                "branch" => format!("refs/heads/{value}"),
                other => {
                    let message = format!("Module {name} has unknown option :{other}");
                    return Err(self.error(line, message));
                }
            };
            if reference.is_some() {
                return Err(self.error(
                    line,
                    format!("Module {name} has more than one of :commit, :tag, :branch, or :ref"),
                ));
            }
            reference = Some(resolved);
        }

        let source = match git {
            Some(url) => {
                if positional.len() > 1 {
                    let message = format!("Module {name} has both :git and a version");
                    return Err(self.error(line, message));
                }
                ModuleSource::Git {
                    url,
                    reference: reference.unwrap_or_else(|| DEFAULT_GIT_REF.to_string()),
                }
            }
            None => {
                if reference.is_some() {
                    let message = format!("Module {name} has a git reference but no :git");
                    return Err(self.error(line, message));
                }
                ModuleSource::Forge {
                    forge_url: self.forge_url.clone(),
                    full_name: full_name.replacen('/', "-", 1),
                    version: positional.get(1).cloned().unwrap_or_else(|| "latest".to_string()),
                }
            }
        };

        self.modules.push(ModuleSpec { name, source });
        Ok(())
    }
}

/// `author-name` and `author/name` both name module `name`.
fn short_name(full_name: &str) -> &str {
    full_name.split_once(['-', '/']).map_or(full_name, |(_, name)| name)
}
