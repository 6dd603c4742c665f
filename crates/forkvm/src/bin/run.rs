//! Load a static guest binary and run it, or call one of its functions.
//!
//! Usage:
//!   cargo run --bin run -- <guest.elf> [function [u64 args...]]
//!
//! Without a function name the binary runs from its entry point.  The
//! timeout can be set with FORKVM_TIMEOUT_MS (default 1000, 0 disables).

use std::env;

use forkvm::{Machine, MachineOptions, VmArg};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <guest.elf> [function [u64 args...]]", args[0]);
        std::process::exit(1);
    }

    let timeout_ms: u32 = env::var("FORKVM_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1_000);

    let binary = std::fs::read(&args[1]).expect("failed to read guest binary");
    let options = MachineOptions {
        verbose_loader: true,
        ..Default::default()
    };
    let mut machine = Machine::new(&binary, &options).expect("failed to create machine");

    let result = match args.get(2) {
        None => {
            log::info!("running from entry point {:#x}", machine.entry_address());
            machine.run(timeout_ms)
        }
        Some(function) => {
            let addr = machine
                .address_of(function)
                .unwrap_or_else(|| panic!("no such guest symbol: {function}"));
            let call_args: Vec<VmArg> = args[3..]
                .iter()
                .map(|a| VmArg::U64(a.parse().expect("arguments must be u64")))
                .collect();
            log::info!("calling {function} at {addr:#x}");
            machine.timed_vmcall(addr, timeout_ms, &call_args)
        }
    };

    match result {
        Ok(()) => {
            log::info!(
                "guest stopped, return value {}",
                machine.return_value().unwrap_or(0),
            );
        }
        Err(e) => {
            log::error!("guest failed: {e}");
            std::process::exit(1);
        }
    }
}
