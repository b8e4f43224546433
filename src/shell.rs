//! Line-oriented command language over a [`KvStore`]
//!
//! One command per line, blank lines and `#` comments ignored:
//!
//! ```text
//! create 7:3                 open 7:3        close 7:3      drop 7:3
//! set 7:3 key value          set default key 0x00ff
//! get 7:3 key                get default key
//! del 7:3 key
//! begin 7:3                  commit 7:3      abort 7:3
//! alloc 4096
//! info
//! ```
//!
//! Keys and values are taken as UTF-8 text unless prefixed with `0x`, in
//! which case the rest is hex. The value of `set` runs to the end of the
//! line, so it may contain spaces.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use tracing::{debug, warn};

use crate::fid::IndexFid;
use crate::plugin::BackendMetadata;
use crate::store::{Index, KvStore, Target};

/// Collection a shell command addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellTarget {
    Index(IndexFid),
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create(IndexFid),
    Open(IndexFid),
    Close(IndexFid),
    Drop(IndexFid),
    Set {
        target: ShellTarget,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Get {
        target: ShellTarget,
        key: Vec<u8>,
    },
    Del {
        fid: IndexFid,
        key: Vec<u8>,
    },
    Begin(IndexFid),
    Commit(IndexFid),
    Abort(IndexFid),
    Alloc(usize),
    Info,
}

/// Decode a key or value token
pub fn parse_bytes(token: &str) -> Result<Vec<u8>> {
    let Some(hex) = token.strip_prefix("0x") else {
        return Ok(token.as_bytes().to_vec());
    };
    if hex.len() % 2 != 0 {
        bail!("odd number of hex digits in '{}'", token);
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow!("invalid hex in '{}'", token))
        })
        .collect()
}

/// Render bytes as text when printable, `0x` hex otherwise
pub fn format_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.is_empty() && !text.starts_with("0x") && !text.chars().any(char::is_control) => {
            text.to_string()
        }
        _ => {
            let mut out = String::with_capacity(2 + bytes.len() * 2);
            out.push_str("0x");
            for byte in bytes {
                out.push_str(&format!("{:02x}", byte));
            }
            out
        }
    }
}

fn parse_fid(token: Option<&str>) -> Result<IndexFid> {
    let token = token.ok_or_else(|| anyhow!("missing fid"))?;
    token.parse::<IndexFid>().with_context(|| format!("bad fid '{}'", token))
}

fn parse_target(token: Option<&str>) -> Result<ShellTarget> {
    match token {
        Some("default") => Ok(ShellTarget::Default),
        other => parse_fid(other).map(ShellTarget::Index),
    }
}

fn parse_key(token: Option<&str>) -> Result<Vec<u8>> {
    parse_bytes(token.ok_or_else(|| anyhow!("missing key"))?)
}

/// Split off the first whitespace-delimited token, returning it and the remainder
fn next_token(text: &str) -> (Option<&str>, &str) {
    let text = text.trim_start();
    if text.is_empty() {
        return (None, "");
    }
    match text.split_once(char::is_whitespace) {
        Some((token, rest)) => (Some(token), rest),
        None => (Some(text), ""),
    }
}

/// Parse one script line; `None` for blank lines and comments
pub fn parse_line(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let mut args = rest.split_whitespace();

    let command = match verb {
        "create" => Command::Create(parse_fid(args.next())?),
        "open" => Command::Open(parse_fid(args.next())?),
        "close" => Command::Close(parse_fid(args.next())?),
        "drop" => Command::Drop(parse_fid(args.next())?),
        "set" => {
            let (target, rest) = next_token(rest);
            let (key, rest) = next_token(rest);
            let target = parse_target(target)?;
            let key = parse_key(key)?;
            let value = rest.trim();
            return Ok(Some(Command::Set {
                target,
                key,
                value: parse_bytes(value)?,
            }));
        }
        "get" => Command::Get {
            target: parse_target(args.next())?,
            key: parse_key(args.next())?,
        },
        "del" => Command::Del {
            fid: parse_fid(args.next())?,
            key: parse_key(args.next())?,
        },
        "begin" => Command::Begin(parse_fid(args.next())?),
        "commit" => Command::Commit(parse_fid(args.next())?),
        "abort" => Command::Abort(parse_fid(args.next())?),
        "alloc" => {
            let size = args.next().ok_or_else(|| anyhow!("missing size"))?;
            Command::Alloc(size.parse::<usize>().with_context(|| format!("bad size '{}'", size))?)
        }
        "info" => Command::Info,
        other => bail!("unknown command '{}'", other),
    };

    if let Some(extra) = args.next() {
        bail!("unexpected argument '{}'", extra);
    }
    Ok(Some(command))
}

#[derive(Serialize)]
struct Info<'a> {
    backend: BackendMetadata,
    open_indexes: Vec<&'a IndexFid>,
}

/// Outcome of running a script
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: usize,
    pub failed: usize,
}

/// Executes commands against a store, keeping one open index per fid
pub struct Shell {
    indexes: BTreeMap<IndexFid, Index>,
    store: KvStore,
}

impl Shell {
    pub fn new(store: KvStore) -> Self {
        Self {
            indexes: BTreeMap::new(),
            store,
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    fn index(&self, fid: IndexFid) -> Result<&Index> {
        self.indexes
            .get(&fid)
            .ok_or_else(|| anyhow!("index {} is not open", fid))
    }

    fn remember(&mut self, index: Index) -> Result<()> {
        let fid = index.fid();
        if let Some(mut previous) = self.indexes.insert(fid, index) {
            previous.close()?;
        }
        Ok(())
    }

    /// Run one command, returning the line to print
    pub fn execute(&mut self, command: Command) -> Result<String> {
        debug!(?command, "Executing shell command");
        match command {
            Command::Create(fid) => {
                let index = self.store.index_create(fid)?;
                self.remember(index)?;
                Ok(format!("created {}", fid))
            }
            Command::Open(fid) => {
                let index = self.store.index_open(fid)?;
                self.remember(index)?;
                Ok(format!("opened {}", fid))
            }
            Command::Close(fid) => {
                let mut index = self
                    .indexes
                    .remove(&fid)
                    .ok_or_else(|| anyhow!("index {} is not open", fid))?;
                index.close()?;
                Ok(format!("closed {}", fid))
            }
            Command::Drop(fid) => {
                if let Some(mut index) = self.indexes.remove(&fid) {
                    index.close()?;
                }
                self.store.index_delete(fid)?;
                Ok(format!("dropped {}", fid))
            }
            Command::Set { target, key, value } => {
                match target {
                    ShellTarget::Index(fid) => self.store.set(Target::Index(self.index(fid)?), &key, &value)?,
                    ShellTarget::Default => self.store.set_default(&key, &value)?,
                }
                Ok("ok".to_string())
            }
            Command::Get { target, key } => {
                let value = match target {
                    ShellTarget::Index(fid) => self.store.get(Target::Index(self.index(fid)?), &key)?,
                    ShellTarget::Default => self.store.get_default(&key)?,
                };
                let line = format_bytes(&value);
                self.store.free(value);
                Ok(line)
            }
            Command::Del { fid, key } => {
                self.store.delete(self.index(fid)?, &key)?;
                Ok("ok".to_string())
            }
            Command::Begin(fid) => {
                self.index(fid)?.begin()?;
                Ok("ok".to_string())
            }
            Command::Commit(fid) => {
                self.index(fid)?.commit()?;
                Ok("ok".to_string())
            }
            Command::Abort(fid) => {
                self.index(fid)?.abort()?;
                Ok("ok".to_string())
            }
            Command::Alloc(size) => {
                let buffer = self.store.alloc(size)?;
                let len = buffer.len();
                self.store.free(buffer);
                Ok(format!("allocated {} bytes", len))
            }
            Command::Info => {
                let info = Info {
                    backend: self.store.metadata(),
                    open_indexes: self.indexes.keys().collect(),
                };
                Ok(serde_json::to_string(&info)?)
            }
        }
    }

    /// Run a script, printing one output line per command
    ///
    /// Failing commands print `error: ...` and the script continues.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for (number, line) in input.lines().enumerate() {
            let line = line.context("failed to read script")?;
            let outcome = match parse_line(&line) {
                Ok(Some(command)) => self.execute(command),
                Ok(None) => continue,
                Err(e) => Err(e),
            };

            summary.executed += 1;
            match outcome {
                Ok(text) => writeln!(output, "{}", text)?,
                Err(e) => {
                    summary.failed += 1;
                    warn!(line = number + 1, error = %e, "Command failed");
                    writeln!(output, "error: {:#}", e)?;
                }
            }
        }
        output.flush()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KvsConfig;

    fn shell() -> Shell {
        Shell::new(KvStore::open(&KvsConfig::new()).unwrap())
    }

    fn run(shell: &mut Shell, script: &str) -> (String, RunSummary) {
        let mut out = Vec::new();
        let summary = shell.run(script.as_bytes(), &mut out).unwrap();
        (String::from_utf8(out).unwrap(), summary)
    }

    #[test]
    fn test_parse_bytes() -> Result<()> {
        assert_eq!(parse_bytes("abc")?, b"abc");
        assert_eq!(parse_bytes("0x00ff10")?, vec![0, 0xff, 0x10]);
        assert_eq!(parse_bytes("0x")?, Vec::<u8>::new());
        assert!(parse_bytes("0xabc").is_err());
        assert!(parse_bytes("0xzz").is_err());
        Ok(())
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(b"hello world"), "hello world");
        assert_eq!(format_bytes(&[1, 2, 3]), "0x010203");
        assert_eq!(format_bytes(b""), "0x");
        // Text that would read back as hex is printed as hex
        assert_eq!(format_bytes(b"0x1"), "0x307831");
    }

    #[test]
    fn test_parse_line() -> Result<()> {
        assert_eq!(parse_line("   ")?, None);
        assert_eq!(parse_line("# comment")?, None);
        assert_eq!(parse_line("create 7:3")?, Some(Command::Create(IndexFid::new(7, 3))));
        assert_eq!(
            parse_line("set default greeting hello there")?,
            Some(Command::Set {
                target: ShellTarget::Default,
                key: b"greeting".to_vec(),
                value: b"hello there".to_vec(),
            })
        );
        assert_eq!(
            parse_line("set 1:2 k")?,
            Some(Command::Set {
                target: ShellTarget::Index(IndexFid::new(1, 2)),
                key: b"k".to_vec(),
                value: Vec::new(),
            })
        );
        assert_eq!(
            parse_line("set 7:3  k   v w")?,
            Some(Command::Set {
                target: ShellTarget::Index(IndexFid::new(7, 3)),
                key: b"k".to_vec(),
                value: b"v w".to_vec(),
            })
        );
        assert_eq!(
            parse_line("set\tdefault \t key\t 0x0102 ")?,
            Some(Command::Set {
                target: ShellTarget::Default,
                key: b"key".to_vec(),
                value: vec![1, 2],
            })
        );
        assert!(parse_line("set default").is_err());
        assert_eq!(parse_line("alloc 0")?, Some(Command::Alloc(0)));
        assert!(parse_line("get 7:3").is_err());
        assert!(parse_line("close 7:3 extra").is_err());
        assert!(parse_line("frobnicate").is_err());
        Ok(())
    }

    #[test]
    fn test_script() {
        let mut shell = shell();
        let script = "\
create 7:3
set 7:3 a 0x010203
get 7:3 a
del 7:3 a
get 7:3 a
close 7:3
drop 7:3
open 7:3
";
        let (out, summary) = run(&mut shell, script);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "created 7:3");
        assert_eq!(lines[2], "0x010203");
        assert_eq!(lines[4], "error: Key not found");
        assert_eq!(lines[6], "dropped 7:3");
        assert_eq!(lines[7], "error: Index not found: fid=7:3");
        assert_eq!(summary, RunSummary { executed: 8, failed: 2 });
    }

    #[test]
    fn test_default_collection_and_info() {
        let mut shell = shell();
        let (out, summary) = run(&mut shell, "set default k v\nget default k\ncreate 1:1\ninfo\n");
        assert_eq!(summary.failed, 0);

        let info: serde_json::Value = serde_json::from_str(out.lines().nth(3).unwrap()).unwrap();
        assert_eq!(info["backend"]["name"], "object-index");
        assert_eq!(info["open_indexes"][0]["lo"], 1);
        assert!(out.starts_with("ok\nv\n"));
    }

    #[test]
    fn test_commands_on_unopened_index() {
        let mut shell = shell();
        let (out, summary) = run(&mut shell, "get 9:9 k\nbegin 9:9\n");
        assert_eq!(summary.failed, 2);
        assert!(out.lines().all(|l| l == "error: index 9:9 is not open"));
    }
}
