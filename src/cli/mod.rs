//! Interactive shell over a session's virtual filesystem

use crate::fs::{FsError, FsShim, MkdirOptions, RmOptions, VirtualFs, path};
use crate::resolver::ResolverProfile;
use crate::runtime::{Runtime, RuntimeError};
use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("Unknown command '{0}'. Type .help for available commands.")]
    UnknownCommand(String),

    #[error("Cannot find module '{0}'")]
    ModuleNotFound(String),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type ShellResult<T> = Result<T, ShellError>;

/// What the loop does after one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Print(String),
    Exit,
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub prompt: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            prompt: "tabnode".to_string(),
        }
    }
}

pub struct Shell {
    runtime: Runtime,
    shim: FsShim,
    config: ShellConfig,
}

impl Shell {
    pub fn new(runtime: Runtime) -> Self {
        Self::with_config(runtime, ShellConfig::default())
    }

    pub fn with_config(runtime: Runtime, config: ShellConfig) -> Self {
        let shim = runtime.fs_shim();
        Self {
            runtime,
            shim,
            config,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn print_banner(&self) {
        println!("{} {}", "tabnode".cyan().bold(), env!("CARGO_PKG_VERSION").green());
        println!("Type {} for help, {} to exit", ".help".yellow(), ".exit".yellow());
        println!();
    }

    fn help_text() -> String {
        [
            "ls [dir]               list a directory",
            "cat <file>             print a file",
            "write <file> <text>    replace a file's contents",
            "mkdir [-p] <dir>       create a directory",
            "rm [-rf] <path>        remove a file or tree",
            "mv <from> <to>         rename",
            "stat <path>            show size, mode and kind",
            "cd <dir>               change directory",
            "pwd                    print the working directory",
            "tree [dir]             print a directory tree",
            "resolve [--cjs] <name>  resolve a specifier from the working directory",
            ".help                  show this message",
            ".exit                  leave the shell",
        ]
        .join("\n")
    }

    /// Run one line and return what to print
    pub fn execute(&mut self, line: &str) -> ShellResult<Outcome> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(Outcome::Print(String::new()));
        };
        let args: Vec<&str> = words.collect();
        debug!(command, ?args, "shell command");

        let output = match command {
            ".exit" | ".quit" | ".q" => return Ok(Outcome::Exit),
            ".help" | ".h" => Self::help_text(),
            "pwd" => self.runtime.cwd(),
            "cd" => {
                self.runtime.chdir(args.first().copied().unwrap_or("/"))?;
                String::new()
            }
            "ls" => self.ls(args.first().copied().unwrap_or("."))?,
            "cat" => {
                let file = args.first().ok_or(ShellError::Usage("cat <file>"))?;
                self.shim.vfs().read_to_string(&self.shim.resolve_path(file))?
            }
            "write" => {
                let (file, text) = args.split_first().ok_or(ShellError::Usage("write <file> <text>"))?;
                self.shim.write_file(*file, text.join(" "))?;
                String::new()
            }
            "mkdir" => {
                let (flags, targets) = split_flags(&args);
                if targets.is_empty() {
                    return Err(ShellError::Usage("mkdir [-p] <dir>"));
                }
                let options = if flags.contains('p') {
                    MkdirOptions::recursive()
                } else {
                    MkdirOptions::default()
                };
                for target in targets {
                    self.shim.mkdir(target, options)?;
                }
                String::new()
            }
            "rm" => {
                let (flags, targets) = split_flags(&args);
                if targets.is_empty() {
                    return Err(ShellError::Usage("rm [-rf] <path>"));
                }
                let options = RmOptions {
                    recursive: flags.contains('r'),
                    force: flags.contains('f'),
                };
                for target in targets {
                    self.shim.rm(target, options)?;
                }
                String::new()
            }
            "mv" => match args.as_slice() {
                [from, to] => {
                    self.shim.rename(from, to)?;
                    String::new()
                }
                _ => return Err(ShellError::Usage("mv <from> <to>")),
            },
            "stat" => {
                let target = args.first().ok_or(ShellError::Usage("stat <path>"))?;
                let stats = self.shim.stat(target)?;
                let kind = if stats.is_directory() { "directory" } else { "file" };
                format!(
                    "{}\n  kind: {}\n  size: {}\n  mode: {:o}\n  ino:  {}",
                    self.shim.resolve_path(target),
                    kind,
                    stats.size,
                    stats.mode,
                    stats.ino
                )
            }
            "tree" => {
                let root = self.shim.resolve_path(args.first().copied().unwrap_or("."));
                let mut lines = vec![root.clone()];
                self.tree(&root, "", &mut lines)?;
                lines.join("\n")
            }
            "resolve" => {
                let (flags, targets) = split_flags(&args);
                let cjs = flags.contains("cjs");
                let specifier = targets.first().ok_or(ShellError::Usage("resolve [--cjs] <specifier>"))?;
                let profile = if cjs {
                    ResolverProfile::dynamic()
                } else {
                    ResolverProfile::declarative()
                };
                self.runtime
                    .resolver(profile)
                    .resolve(specifier, &self.runtime.cwd())
                    .ok_or_else(|| ShellError::ModuleNotFound(specifier.to_string()))?
            }
            other => return Err(ShellError::UnknownCommand(other.to_string())),
        };
        Ok(Outcome::Print(output))
    }

    fn ls(&self, dir: &str) -> ShellResult<String> {
        let entries = self.shim.read_dir_entries(dir)?;
        Ok(entries
            .iter()
            .map(|entry| {
                if entry.is_directory() {
                    format!("{}/", entry.name)
                } else {
                    entry.name.clone()
                }
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn tree(&self, dir: &str, indent: &str, lines: &mut Vec<String>) -> ShellResult<()> {
        let entries = self.shim.read_dir_entries(dir)?;
        let count = entries.len();
        for (i, entry) in entries.into_iter().enumerate() {
            let last = i + 1 == count;
            let branch = if last { "└── " } else { "├── " };
            lines.push(format!("{}{}{}", indent, branch, entry.name));
            if entry.is_directory() {
                let child_indent = format!("{}{}", indent, if last { "    " } else { "│   " });
                self.tree(&path::join(&[dir, entry.name.as_str()]), &child_indent, lines)?;
            }
        }
        Ok(())
    }

    /// Read lines from stdin until `.exit` or EOF
    pub fn run(&mut self) -> ShellResult<()> {
        self.print_banner();

        let stdin = io::stdin();
        let mut stdout = io::stdout();

        loop {
            print!("{} {}> ", self.config.prompt.cyan(), self.runtime.cwd());
            stdout.flush()?;

            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => {
                    println!();
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    println!("{}: Failed to read input: {}", "Error".red(), e);
                    continue;
                }
            }

            match self.execute(line.trim()) {
                Ok(Outcome::Exit) => break,
                Ok(Outcome::Print(output)) if output.is_empty() => {}
                Ok(Outcome::Print(output)) => println!("{}", output),
                Err(e) => println!("{}: {}", "Error".red(), e),
            }
        }

        println!("{}", "Goodbye!".cyan());
        Ok(())
    }
}

/// `-rf`, `-p` and `--cjs` style flags, concatenated, plus the remaining words
fn split_flags<'a>(args: &[&'a str]) -> (String, Vec<&'a str>) {
    let mut flags = String::new();
    let mut rest = Vec::new();
    for arg in args {
        match arg.strip_prefix('-') {
            Some(flag) if !flag.is_empty() => flags.push_str(flag.trim_start_matches('-')),
            _ => rest.push(*arg),
        }
    }
    (flags, rest)
}

/// Copy a host directory into the virtual tree, returning the number of files copied
pub fn import_host_tree(fs: &VirtualFs, host_dir: &Path, vfs_dir: &str) -> ShellResult<usize> {
    fs.mkdir(vfs_dir, MkdirOptions::recursive())?;
    let mut copied = 0;
    for entry in std::fs::read_dir(host_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let target = path::join(&[vfs_dir, name.as_str()]);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copied += import_host_tree(fs, &entry.path(), &target)?;
        } else if file_type.is_file() {
            fs.write_file(&target, std::fs::read(entry.path())?)?;
            copied += 1;
        }
    }
    debug!(host = %host_dir.display(), vfs = vfs_dir, copied, "imported host tree");
    Ok(copied)
}
