// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `sigilc` — inspect and run sigil modules from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};

use sigil::disasm::disasm_function;
use sigil::module::{ExportKind, FuncKind, Module};
use sigil::trace::{TraceEvent, TraceMask, TraceSink};
use sigil::value::{Value, ValueType};
use sigil::vm::{Config, Vm};

#[derive(Parser)]
#[command(name = "sigilc", version, about = "Sigil plugin runtime CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a module's imports, exports, memory, and (optionally) code.
    Inspect {
        /// Module file.
        file: PathBuf,
        /// Also disassemble every function body.
        #[arg(long)]
        code: bool,
    },
    /// Load a module and call an exported function.
    Run {
        /// Module file.
        file: PathBuf,
        /// Exported function name.
        export: String,
        /// Arguments, parsed according to the export's parameter types.
        args: Vec<String>,
        /// Instruction budget (0 disables metering).
        #[arg(long, default_value_t = 0)]
        fuel: u64,
        /// Print each executed instruction and call to stderr.
        #[arg(long)]
        trace: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Inspect { file, code } => inspect(&file, code),
        Commands::Run {
            file,
            export,
            args,
            fuel,
            trace,
        } => run(&file, &export, &args, fuel, trace),
    }
}

fn load(file: &PathBuf) -> Result<Module> {
    let bytes =
        std::fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
    Module::load(&bytes).map_err(|e| anyhow!("invalid module: {e}"))
}

fn inspect(file: &PathBuf, code: bool) -> Result<()> {
    let module = load(file)?;

    println!("module {}", file.display());
    match module.memory() {
        Some(m) => println!(
            "  memory: {} initial pages, {} max",
            m.initial_pages, m.max_pages
        ),
        None => println!("  memory: none"),
    }
    println!("  globals: {}", module.globals().len());

    println!("  imports ({}):", module.import_count());
    for (i, imp) in module.imports().iter().enumerate() {
        println!("    [{i}] {}::{} (type {})", imp.module, imp.name, imp.type_idx);
    }

    println!("  functions ({}):", module.func_count());
    for (i, f) in module.functions().iter().enumerate() {
        match &f.kind {
            FuncKind::Import { import_idx } => {
                println!("    [{i}] import #{import_idx}");
            }
            FuncKind::Body(body) => {
                println!(
                    "    [{i}] body: {} words, {} regs",
                    body.code_words(),
                    body.reg_count
                );
            }
        }
    }

    println!("  exports ({}):", module.exports().len());
    for e in module.exports() {
        let kind = match e.kind {
            ExportKind::Func => "func",
            ExportKind::Memory => "memory",
            ExportKind::Global => "global",
        };
        println!("    {} {} -> {}", kind, e.name, e.index);
    }

    if code {
        for i in 0..module.func_count() {
            if let Some(text) = disasm_function(&module, i) {
                println!("\n  func [{i}]:");
                for line in text.lines() {
                    println!("    {line}");
                }
            }
        }
    }
    Ok(())
}

/// Prints trace events to stderr.
struct StderrTrace;

impl TraceSink for StderrTrace {
    fn mask(&self) -> TraceMask {
        TraceMask::CALL | TraceMask::INSTR | TraceMask::HOST
    }

    fn event(&mut self, event: TraceEvent<'_>) {
        match event {
            TraceEvent::CallEnter { func, depth } => {
                eprintln!("{:width$}-> f{func}", "", width = depth * 2);
            }
            TraceEvent::CallExit { func, depth } => {
                eprintln!("{:width$}<- f{func}", "", width = depth * 2);
            }
            TraceEvent::Instr { func, pc, opcode } => {
                eprintln!("   f{func} pc={pc} op={opcode:#04x}");
            }
            TraceEvent::HostCall { module, name, args } => {
                eprintln!("   host {module}::{name}/{args}");
            }
        }
    }
}

fn run(file: &PathBuf, export: &str, raw_args: &[String], fuel: u64, trace: bool) -> Result<()> {
    let module = Arc::new(load(file)?);

    let Some(index) = module.export_func(export) else {
        bail!("export not found: {export}");
    };
    let params: Vec<ValueType> = module
        .func_type(index)
        .map(|t| t.params.clone())
        .unwrap_or_default();
    if raw_args.len() != params.len() {
        bail!(
            "{export} takes {} arguments, got {}",
            params.len(),
            raw_args.len()
        );
    }
    let args = parse_args(&params, raw_args)?;

    let mut vm = Vm::new(
        Arc::clone(&module),
        Config {
            fuel_limit: fuel,
            ..Config::default()
        },
    );
    vm.init().map_err(|e| anyhow!("instantiation failed: {e}"))?;

    let result = if trace {
        let mut sink = StderrTrace;
        vm.call_traced(export, &args, &mut sink)
    } else {
        vm.call(export, &args)
    };

    match result {
        Ok(Value::Void) => println!("(no return value)"),
        Ok(v) => println!("{v}"),
        Err(e) => bail!("trap: {e}"),
    }
    Ok(())
}

fn parse_args(params: &[ValueType], raw: &[String]) -> Result<Vec<Value>> {
    params
        .iter()
        .zip(raw)
        .map(|(ty, s)| {
            let v = match ty {
                ValueType::I32 | ValueType::Ptr => Value::I32(
                    s.parse::<i32>()
                        .with_context(|| format!("cannot parse {s:?} as i32"))?,
                ),
                ValueType::I64 => Value::I64(
                    s.parse::<i64>()
                        .with_context(|| format!("cannot parse {s:?} as i64"))?,
                ),
                ValueType::F32 => Value::F32(
                    s.parse::<f32>()
                        .with_context(|| format!("cannot parse {s:?} as f32"))?,
                ),
                ValueType::F64 => Value::F64(
                    s.parse::<f64>()
                        .with_context(|| format!("cannot parse {s:?} as f64"))?,
                ),
                ValueType::Bool => Value::Bool(
                    s.parse::<bool>()
                        .with_context(|| format!("cannot parse {s:?} as bool"))?,
                ),
            };
            Ok(v)
        })
        .collect()
}
