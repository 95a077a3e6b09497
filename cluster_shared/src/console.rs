//! Console.
//!
//! Line-oriented command interpreter shared by master and slaves:
//! - typed console variables (cvars) with flags,
//! - registered command handlers,
//! - quoting-aware tokenizing.
//!
//! Slaves run `COMMAND` lines from the master through their console and send
//! the output back as `PRINT` when the master registered for output. The
//! server binary feeds stdin lines through its own console.
//!
//! ```ignore
//! let mut console = Console::new();
//! console.register_cvar("r_stats", CvarValue::Bool(false), "Draw frame stats", CvarFlags::REMOTE);
//! let lines = console.exec("r_stats 1")?;
//! ```

use std::{collections::BTreeMap, fmt};

use anyhow::{bail, Context};

/// Console variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum CvarValue {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl CvarValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CvarValue::Int(v) => Some(*v),
            CvarValue::Float(v) => Some(*v as i64),
            CvarValue::Bool(v) => Some(i64::from(*v)),
            CvarValue::String(s) => s.parse().ok(),
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            CvarValue::Float(v) => Some(*v),
            CvarValue::Int(v) => Some(*v as f64),
            CvarValue::String(s) => s.parse().ok(),
            CvarValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            CvarValue::Bool(v) => *v,
            CvarValue::Int(v) => *v != 0,
            CvarValue::Float(v) => *v != 0.0,
            CvarValue::String(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        }
    }

    /// Parses `raw` into the same variant as `self`.
    fn parse_like(&self, raw: &str) -> anyhow::Result<CvarValue> {
        Ok(match self {
            CvarValue::Int(_) => CvarValue::Int(raw.parse().with_context(|| format!("'{raw}' is not an integer"))?),
            CvarValue::Float(_) => CvarValue::Float(raw.parse().with_context(|| format!("'{raw}' is not a number"))?),
            CvarValue::Bool(_) => CvarValue::Bool(match raw {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => bail!("'{raw}' is not a boolean"),
            }),
            CvarValue::String(_) => CvarValue::String(raw.to_string()),
        })
    }
}

impl fmt::Display for CvarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CvarValue::Int(v) => write!(f, "{v}"),
            CvarValue::Float(v) => write!(f, "{v}"),
            CvarValue::String(v) => write!(f, "\"{v}\""),
            CvarValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

bitflags::bitflags! {
    /// Cvar flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CvarFlags: u32 {
        /// Only readable from the console.
        const READ_ONLY = 1 << 0;
        /// May be changed by a `COMMAND` from the master.
        const REMOTE = 1 << 1;
        /// Master-side setting.
        const MASTER_ONLY = 1 << 2;
    }
}

/// Console variable.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub value: CvarValue,
    pub default: CvarValue,
    pub description: String,
    pub flags: CvarFlags,
}

/// Command handler function type.
pub type CommandHandler = Box<dyn Fn(&[&str], &mut ConsoleContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// State handed to a running command.
pub struct ConsoleContext<'a> {
    pub output: Vec<String>,
    cvars: &'a mut BTreeMap<String, Cvar>,
    remote: bool,
}

impl ConsoleContext<'_> {
    pub fn print(&mut self, msg: impl Into<String>) {
        self.output.push(msg.into());
    }

    pub fn get_cvar(&self, name: &str) -> Option<&CvarValue> {
        self.cvars.get(name).map(|c| &c.value)
    }

    /// Parses and stores a cvar, honoring its flags.
    pub fn set_cvar(&mut self, name: &str, raw: &str) -> anyhow::Result<CvarValue> {
        let remote = self.remote;
        let Some(cvar) = self.cvars.get_mut(name) else {
            bail!("unknown cvar: {name}");
        };
        if cvar.flags.contains(CvarFlags::READ_ONLY) {
            bail!("{name} is read-only");
        }
        if remote && !cvar.flags.contains(CvarFlags::REMOTE) {
            bail!("{name} cannot be set remotely");
        }
        cvar.value = cvar.default.parse_like(raw.trim_matches('"'))?;
        Ok(cvar.value.clone())
    }
}

/// The console.
pub struct Console {
    cvars: BTreeMap<String, Cvar>,
    commands: BTreeMap<String, CommandHandler>,
    history: Vec<String>,
    max_history: usize,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        let mut console = Self {
            cvars: BTreeMap::new(),
            commands: BTreeMap::new(),
            history: Vec::new(),
            max_history: 100,
        };
        console.register_builtin_commands();
        console
    }

    fn register_builtin_commands(&mut self) {
        self.register_command("echo", |args, ctx| {
            ctx.print(args.join(" "));
            Ok(())
        });

        self.register_command("cvarlist", |_args, ctx| {
            let lines: Vec<String> = ctx
                .cvars
                .iter()
                .map(|(name, cvar)| format!("  {name} = {} (default: {})", cvar.value, cvar.default))
                .collect();
            ctx.output.extend(lines);
            Ok(())
        });

        self.register_command("set", |args, ctx| {
            let [name, rest @ ..] = args else {
                bail!("usage: set <cvar> <value>");
            };
            if rest.is_empty() {
                bail!("usage: set <cvar> <value>");
            }
            let value = ctx.set_cvar(name, &rest.join(" "))?;
            ctx.print(format!("{name} = {value}"));
            Ok(())
        });

        self.register_command("reset", |args, ctx| {
            let Some(name) = args.first() else {
                bail!("usage: reset <cvar>");
            };
            let default = match ctx.cvars.get(*name) {
                Some(cvar) => cvar.default.to_string(),
                None => bail!("unknown cvar: {name}"),
            };
            let value = ctx.set_cvar(name, &default)?;
            ctx.print(format!("{name} = {value}"));
            Ok(())
        });
    }

    pub fn register_cvar(&mut self, name: &str, default: CvarValue, description: &str, flags: CvarFlags) {
        self.cvars.insert(
            name.to_string(),
            Cvar {
                value: default.clone(),
                default,
                description: description.to_string(),
                flags,
            },
        );
    }

    pub fn register_command<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&[&str], &mut ConsoleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.commands.insert(name.to_string(), Box::new(handler));
    }

    /// Names of every registered command, sorted.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Executes a line typed locally.
    pub fn exec(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        self.run(line, false)
    }

    /// Executes a line received from the master.
    pub fn exec_remote(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        self.run(line, true)
    }

    fn run(&mut self, line: &str, remote: bool) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return Ok(Vec::new());
        }

        self.history.push(line.to_string());
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        let tokens = parse_command_line(line);
        let Some((name, rest)) = tokens.split_first() else {
            return Ok(Vec::new());
        };
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();

        let mut ctx = ConsoleContext {
            output: Vec::new(),
            cvars: &mut self.cvars,
            remote,
        };

        if let Some(handler) = self.commands.get(name) {
            handler(&args, &mut ctx).with_context(|| format!("command '{name}'"))?;
            return Ok(ctx.output);
        }

        // A bare cvar name queries it; with arguments it sets it.
        match ctx.cvars.get(name.as_str()) {
            Some(cvar) if args.is_empty() => {
                let line = format!("{name} = {} (default: {})", cvar.value, cvar.default);
                ctx.print(line);
            }
            Some(_) => {
                let value = ctx.set_cvar(name, &args.join(" "))?;
                ctx.print(format!("{name} = {value}"));
            }
            None => ctx.print(format!("Unknown command: {name}")),
        }
        Ok(ctx.output)
    }

    pub fn get_cvar(&self, name: &str) -> Option<&CvarValue> {
        self.cvars.get(name).map(|c| &c.value)
    }

    /// Stores a value maintained by the program itself, flags ignored.
    pub fn set_internal(&mut self, name: &str, value: CvarValue) {
        if let Some(cvar) = self.cvars.get_mut(name) {
            cvar.value = value;
        }
    }

    pub fn cvar(&self, name: &str) -> Option<&Cvar> {
        self.cvars.get(name)
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }
}

/// Splits a command line into tokens, keeping quoted spans together.
pub fn parse_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
