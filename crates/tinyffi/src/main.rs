use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tinyffi_core::module::ModuleRegistry;
use tinyffi_core::registers::{Arm64Register, RegisterId, RegisterSetKind, X64Register};
use tinyffi_core::stub::Stub;
use tinyffi_core::types::{ArchitectureId, PlatformId};
use tinyffi_core::{Context, CoroutineState};
use tinyffi_utils::{info, init_logging, init_logging_to_dir, init_logging_with_level, LogFormat, LogLevel};

/// Call foreign machine code on private stacks, issue raw syscalls and run
/// resumable coroutines.
#[derive(Parser, Debug)]
#[command(name = "tinyffi")]
#[command(version)]
#[command(about = "Cross-architecture foreign call engine", long_about = None)]
struct Cli
{
    /// Log level (error, warn, info, debug, trace). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Write logs to a dated file in this directory instead of stdout
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Show the host target, registered modules and supported register sets
    Info,
    /// Invoke a syscall directly through the platform's gate
    Syscall
    {
        /// Syscall number (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_number)]
        number: u64,
        /// Up to six arguments (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_number, num_args = 0..=6)]
        args: Vec<u64>,
    },
    /// Assemble a small routine into a stub, call it, then run a coroutine
    Demo
    {
        /// Closure size in bytes
        #[arg(short, long, default_value_t = 64 * 1024)]
        stack_size: usize,
    },
}

fn main()
{
    let cli = Cli::parse();

    let logging = match (&cli.log_dir, cli.log_level) {
        (Some(dir), level) => init_logging_to_dir(dir, level).map(|_| ()),
        (None, Some(level)) => init_logging_with_level(level, LogFormat::Pretty),
        (None, None) => init_logging(),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    if let Err(e) = run_command(cli.command) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_command(command: Commands) -> Result<(), Box<dyn std::error::Error>>
{
    match command {
        Commands::Info => print_info(),
        Commands::Syscall { number, args } => run_syscall(number, &args),
        Commands::Demo { stack_size } => run_demo(stack_size),
    }
}

fn parse_number(s: &str) -> Result<u64, String>
{
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

/// Registers carrying syscall arguments, in order, and the result register.
fn syscall_registers(arch: ArchitectureId) -> Option<([RegisterId; 6], RegisterId)>
{
    match arch {
        ArchitectureId::X64 => Some((
            [
                X64Register::Rdi,
                X64Register::Rsi,
                X64Register::Rdx,
                X64Register::R10,
                X64Register::R8,
                X64Register::R9,
            ]
            .map(RegisterId::X64),
            RegisterId::X64(X64Register::Rax),
        )),
        ArchitectureId::Arm64 => Some((
            [0, 1, 2, 3, 4, 5].map(|n| RegisterId::Arm64(Arm64Register::X(n))),
            RegisterId::Arm64(Arm64Register::X(0)),
        )),
        _ => None,
    }
}

fn print_info() -> Result<(), Box<dyn std::error::Error>>
{
    let registry = ModuleRegistry::global();

    println!("=== Host ===");
    match ArchitectureId::current() {
        Some(arch) => println!("Architecture: {}", arch),
        None => println!("Architecture: unknown"),
    }
    match PlatformId::current() {
        Some(platform) => println!("Platform:     {}", platform),
        None => println!("Platform:     unknown"),
    }

    println!("\n=== Registered modules ===");
    let architectures: Vec<String> = registry.architectures().map(|id| id.to_string()).collect();
    let platforms: Vec<String> = registry.platforms().map(|id| id.to_string()).collect();
    println!("Architectures: {}", display_list(&architectures));
    println!("Platforms:     {}", display_list(&platforms));

    for id in registry.architectures() {
        let module = registry.architecture(id)?;
        let stack = module.stack();
        println!("\n=== {} ===", id);
        println!("Default stack: {} bytes (minimum {})", stack.default_size, stack.minimum);
        for kind in RegisterSetKind::ALL {
            let status = if module.default_mask().contains(kind) {
                "loaded by default"
            } else if module.supports(kind) {
                "supported"
            } else {
                "unavailable"
            };
            println!("  {:<10} {}", format!("{:?}", kind), status);
        }
    }
    Ok(())
}

fn display_list(items: &[String]) -> String
{
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn run_syscall(number: u64, args: &[u64]) -> Result<(), Box<dyn std::error::Error>>
{
    let mut ctx = Context::native()?;
    let (arg_registers, result_register) = syscall_registers(ctx.architecture())
        .ok_or_else(|| format!("no syscall convention for {}", ctx.architecture()))?;

    let mut regs = ctx.new_registers();
    regs.add(RegisterSetKind::General)?;
    for (id, value) in arg_registers.iter().zip(args) {
        regs.set(*id, *value);
    }

    info!("Invoking syscall {} with {} argument(s)", number, args.len());
    ctx.syscall(number, &mut regs)?;

    let result = regs.get(result_register).unwrap_or_default();
    println!("syscall {} returned {} (0x{:x})", number, result as i64, result);
    Ok(())
}

/// Returns the two demo routines for `arch`:
/// - `add(a, b) -> a + b`
/// - a coroutine that yields 1, then 2, then returns 3; the yield trap
///   address arrives in the first argument register
fn demo_programs(arch: ArchitectureId) -> Option<(Vec<u8>, Vec<u8>)>
{
    match arch {
        ArchitectureId::X64 => Some((
            // mov rax, rdi; add rax, rsi; ret
            vec![0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0, 0xC3],
            // mov rbx, rdi; mov eax, 1; call rbx; mov eax, 2; call rbx; mov eax, 3; ret
            vec![
                0x48, 0x89, 0xFB, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xFF, 0xD3, 0xB8, 0x02, 0x00, 0x00, 0x00, 0xFF,
                0xD3, 0xB8, 0x03, 0x00, 0x00, 0x00, 0xC3,
            ],
        )),
        ArchitectureId::Arm64 => Some((
            // add x0, x0, x1; ret
            words(&[0x8B01_0000, 0xD65F_03C0]),
            // mov x19, x0; mov x20, x30; mov x0, #1; blr x19; mov x0, #2; blr x19;
            // mov x0, #3; mov x30, x20; ret
            words(&[
                0xAA00_03F3,
                0xAA1E_03F4,
                0xD280_0020,
                0xD63F_0260,
                0xD280_0040,
                0xD63F_0260,
                0xD280_0060,
                0xAA14_03FE,
                0xD65F_03C0,
            ]),
        )),
        _ => None,
    }
}

fn words(instructions: &[u32]) -> Vec<u8>
{
    instructions.iter().flat_map(|word| word.to_le_bytes()).collect()
}

fn run_demo(stack_size: usize) -> Result<(), Box<dyn std::error::Error>>
{
    let mut ctx = Context::builder().stack_size(stack_size).build()?;
    let arch = ctx.architecture();
    let (add, counter) = demo_programs(arch).ok_or_else(|| format!("no demo routines for {}", arch))?;
    let (args, result) = syscall_registers(arch).ok_or_else(|| format!("no argument registers for {}", arch))?;

    println!("=== Call ===");
    let stub = Stub::with_code(ctx.platform_module(), &add)?;
    let mut regs = ctx.new_registers();
    regs.add(RegisterSetKind::General)?;
    regs.set(args[0], 40);
    regs.set(args[1], 2);
    ctx.call(stub.pc()?, &mut regs)?;
    println!("add(40, 2) at {} = {}", stub.pc()?, regs.get(result).unwrap_or_default());

    println!("\n=== Coroutine ===");
    let target = Stub::with_code(ctx.platform_module(), &counter)?;
    let mut co = ctx.coroutine()?;
    let trap = co.yield_pc()?;
    co.registers_mut().set(args[0], trap.value());

    let mut state = co.start(target.pc()?)?;
    loop {
        let value = co.registers().get(result).unwrap_or_default();
        match state {
            CoroutineState::Yielded => {
                println!("yielded {} (resume at {})", value, co.resume_pc());
                state = co.resume()?;
            }
            _ => {
                println!("completed with {}", value);
                break;
            }
        }
    }

    co.free()?;
    ctx.destroy()?;
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_number()
    {
        assert_eq!(parse_number("39").unwrap(), 39);
        assert_eq!(parse_number("0x27").unwrap(), 39);
        assert_eq!(parse_number("0XFF").unwrap(), 255);
        assert!(parse_number("0xzz").is_err());
        assert!(parse_number("-1").is_err());
    }

    #[test]
    fn test_demo_routines_end_in_return()
    {
        let (add, counter) = demo_programs(ArchitectureId::X64).unwrap();
        assert_eq!(add.last(), Some(&0xC3));
        assert_eq!(counter.last(), Some(&0xC3));

        let (add, counter) = demo_programs(ArchitectureId::Arm64).unwrap();
        assert_eq!(&add[add.len() - 4..], &[0xC0, 0x03, 0x5F, 0xD6]);
        assert_eq!(counter.len(), 9 * 4);
        assert!(demo_programs(ArchitectureId::Mips64).is_none());
    }

    #[test]
    fn test_cli_parses_global_flags()
    {
        let cli = Cli::try_parse_from(["tinyffi", "syscall", "0x27", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        match cli.command {
            Commands::Syscall { number, args } => {
                assert_eq!(number, 39);
                assert!(args.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
