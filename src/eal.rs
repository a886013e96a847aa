//! Shared-memory runtime bootstrap
//!
//! There is one runtime per process, initialized exactly once before any
//! resource-manager call. `EalBootstrap` turns a [`Config`] into the ordered
//! argument vector the runtime understands; [`init`] applies that vector to
//! the process-global [`RuntimeContext`] and reports how many arguments it
//! consumed, leaving application arguments untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use log::{debug, info};

use crate::conf::Config;
use crate::error::{Result, TransportError};
use crate::memory::SegmentLocator;

/// Process type selector carried on the argument vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcType {
    Primary,
    Secondary,
}

impl ProcType {
    pub fn as_flag(&self) -> &'static str {
        match self {
            ProcType::Primary => "--proc-type=primary",
            ProcType::Secondary => "--proc-type=secondary",
        }
    }
}

/// Builds the runtime argument vector from a config
#[derive(Debug)]
pub struct EalBootstrap {
    prog: String,
    config: Config,
}

impl EalBootstrap {
    pub fn new(config: Config, prog: impl Into<String>) -> Self {
        Self {
            prog: prog.into(),
            config,
        }
    }

    /// Produce the ordered argument vector. Extra strings are appended
    /// verbatim after the flags derived from config.
    pub fn build_args(&self, extra: &[String]) -> Vec<String> {
        let rt = &self.config.runtime;
        let mut args = vec![self.prog.clone()];

        let push_kv = |args: &mut Vec<String>, k: &str, v: &str| {
            if !v.is_empty() {
                args.push(k.to_string());
                args.push(v.to_string());
            }
        };

        push_kv(&mut args, "--file-prefix", &rt.file_prefix);
        push_kv(&mut args, "--huge-dir", &rt.huge_dir);
        push_kv(&mut args, "--socket-mem", &rt.socket_mem);
        push_kv(&mut args, "--iova", &rt.iova);
        if rt.no_pci {
            args.push("--no-pci".to_string());
        }
        if let Some(lcores) = &rt.lcores {
            push_kv(&mut args, "--lcores", lcores);
        }
        if let Some(main) = rt.main_lcore {
            push_kv(&mut args, "--main-lcore", &main.to_string());
        }
        if let Some(limit) = &rt.socket_limit {
            push_kv(&mut args, "--socket-limit", limit);
        }

        let proc_type = if self.config.role.is_primary() {
            ProcType::Primary
        } else {
            ProcType::Secondary
        };
        args.push(proc_type.as_flag().to_string());

        args.extend(extra.iter().cloned());
        args
    }

    /// Render the vector as a single command line for logging
    pub fn args_as_cmdline(&self, args: &[String]) -> String {
        args.iter()
            .map(|a| {
                if a.contains(' ') {
                    format!("\"{}\"", a)
                } else {
                    a.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Per-process runtime state resolved from the argument vector
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    locator: SegmentLocator,
    proc_type: ProcType,
    socket_mem: Option<String>,
    iova: String,
    no_pci: bool,
    lcores: Option<String>,
    main_lcore: Option<u32>,
    socket_limit: Option<String>,
}

impl RuntimeContext {
    /// Build a context straight from a config, bypassing the argument
    /// vector. Resource managers and tests use this path; the process
    /// entrypoint goes through [`init`].
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let rt = &config.runtime;
        Ok(Self {
            locator: SegmentLocator::new(&rt.huge_dir, &rt.file_prefix),
            proc_type: if config.role.is_primary() {
                ProcType::Primary
            } else {
                ProcType::Secondary
            },
            socket_mem: (!rt.socket_mem.is_empty()).then(|| rt.socket_mem.clone()),
            iova: rt.iova.clone(),
            no_pci: rt.no_pci,
            lcores: rt.lcores.clone(),
            main_lcore: rt.main_lcore,
            socket_limit: rt.socket_limit.clone(),
        })
    }

    /// Parse an argument vector. Returns the context and the number of
    /// consumed arguments; parsing stops at the first unrecognized flag.
    pub fn parse_args(args: &[String]) -> Result<(Self, usize)> {
        let mut file_prefix = None;
        let mut huge_dir = None;
        let mut socket_mem = None;
        let mut iova = "va".to_string();
        let mut no_pci = false;
        let mut lcores = None;
        let mut main_lcore = None;
        let mut socket_limit = None;
        let mut proc_type = ProcType::Primary;

        let mut i = 0;
        // argv[0] is the program name when present
        if i < args.len() && !args[i].starts_with("--") {
            i += 1;
        }

        let take_value = |args: &[String], i: &mut usize, flag: &str| -> Result<String> {
            if *i + 1 >= args.len() {
                return Err(TransportError::runtime_init(format!(
                    "{flag} requires a value"
                )));
            }
            *i += 2;
            Ok(args[*i - 1].clone())
        };

        while i < args.len() {
            let arg = args[i].as_str();
            match arg {
                "--file-prefix" => file_prefix = Some(take_value(args, &mut i, arg)?),
                "--huge-dir" => huge_dir = Some(take_value(args, &mut i, arg)?),
                "--socket-mem" => socket_mem = Some(take_value(args, &mut i, arg)?),
                "--iova" => iova = take_value(args, &mut i, arg)?,
                "--lcores" => lcores = Some(take_value(args, &mut i, arg)?),
                "--socket-limit" => socket_limit = Some(take_value(args, &mut i, arg)?),
                "--main-lcore" => {
                    let v = take_value(args, &mut i, arg)?;
                    let parsed = v.parse::<u32>().map_err(|_| {
                        TransportError::runtime_init(format!("bad --main-lcore value '{v}'"))
                    })?;
                    main_lcore = Some(parsed);
                }
                "--no-pci" => {
                    no_pci = true;
                    i += 1;
                }
                _ if arg.starts_with("--proc-type=") => {
                    proc_type = match &arg["--proc-type=".len()..] {
                        "primary" => ProcType::Primary,
                        "secondary" => ProcType::Secondary,
                        other => {
                            return Err(TransportError::runtime_init(format!(
                                "unknown proc-type '{other}'"
                            )))
                        }
                    };
                    i += 1;
                }
                // application arguments start here
                _ => break,
            }
        }

        let file_prefix = file_prefix
            .ok_or_else(|| TransportError::runtime_init("--file-prefix is required"))?;
        let huge_dir =
            huge_dir.ok_or_else(|| TransportError::runtime_init("--huge-dir is required"))?;

        if !std::path::Path::new(&huge_dir).is_dir() {
            return Err(TransportError::runtime_init(format!(
                "huge dir '{huge_dir}' does not exist"
            )));
        }

        let ctx = Self {
            locator: SegmentLocator::new(huge_dir, file_prefix),
            proc_type,
            socket_mem,
            iova,
            no_pci,
            lcores,
            main_lcore,
            socket_limit,
        };
        Ok((ctx, i))
    }

    pub fn locator(&self) -> &SegmentLocator {
        &self.locator
    }

    pub fn proc_type(&self) -> ProcType {
        self.proc_type
    }

    pub fn socket_mem(&self) -> Option<&str> {
        self.socket_mem.as_deref()
    }

    pub fn iova(&self) -> &str {
        &self.iova
    }

    pub fn no_pci(&self) -> bool {
        self.no_pci
    }

    pub fn lcores(&self) -> Option<&str> {
        self.lcores.as_deref()
    }

    pub fn main_lcore(&self) -> Option<u32> {
        self.main_lcore
    }

    pub fn socket_limit(&self) -> Option<&str> {
        self.socket_limit.as_deref()
    }
}

static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static CONTEXT: OnceLock<RuntimeContext> = OnceLock::new();

/// Initialize the process-global runtime from an argument vector.
///
/// Returns the number of consumed arguments. A second call in the same
/// process fails with `AlreadyInitialized` whether or not the first one
/// succeeded to the end; the runtime is not restartable.
pub fn init(args: &[String]) -> Result<usize> {
    if INIT_STARTED.swap(true, Ordering::SeqCst) {
        return Err(TransportError::AlreadyInitialized);
    }

    apply_env_log_level();

    let (ctx, consumed) = RuntimeContext::parse_args(args)?;
    info!(
        "runtime init: prefix={} dir={} proc_type={:?} ({} args consumed)",
        ctx.locator.file_prefix(),
        ctx.locator.huge_dir().display(),
        ctx.proc_type,
        consumed
    );
    let _ = CONTEXT.set(ctx);
    Ok(consumed)
}

/// True once [`init`] has been called (successfully or not)
pub fn is_initialized() -> bool {
    INIT_STARTED.load(Ordering::SeqCst)
}

/// The process-global context, when [`init`] succeeded
pub fn context() -> Option<&'static RuntimeContext> {
    CONTEXT.get()
}

/// `RUNTIME_LOG_LEVEL` carries a numeric verbosity for the shared-memory
/// runtime; it only applies when the standard `RUST_LOG` is unset.
fn apply_env_log_level() {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let Ok(level) = std::env::var("RUNTIME_LOG_LEVEL") else {
        return;
    };
    let filter = match level.trim().parse::<u8>() {
        Ok(0) => log::LevelFilter::Off,
        Ok(1) => log::LevelFilter::Error,
        Ok(2) => log::LevelFilter::Warn,
        Ok(3) => log::LevelFilter::Info,
        Ok(4) => log::LevelFilter::Debug,
        Ok(_) => log::LevelFilter::Trace,
        Err(_) => return,
    };
    debug!("RUNTIME_LOG_LEVEL={} -> {:?}", level, filter);
    log::set_max_level(filter);
}
