//! Control client for the hypervisor's VMMCALL interface.
//!
//! Runs inside the virtualized guest and drives the introspection, stealth
//! and telemetry opcodes. See `hv-control help` for the command surface.

use svm_hypervisor::hypercall::{self, HypercallMessage};
use thiserror::Error;

mod vmcall;

#[derive(Debug, Error)]
enum CliError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid number: {0}")]
    Parse(String),
}

const HELP: &str = "\
hv-control <command>

  stealth on|off
  cr3-cloak on|off
  read <gva>
  write <gva> <value>
  translate gva-gpa|gva-hpa|gpa-hpa <address>
  shadow-hook install <gva> <hpa>
  shadow-hook clear
  triggers arm <gva-of-page-list>
  triggers rearm
  syscall-hook set <address>
  syscall-hook on|off
  mailbox pop
  mailbox push <code>
  process base [pid]
  process dirbase <pid>
  telemetry [clear]

Numbers accept decimal or 0x-prefixed hex.";

fn parse_u64(input: &str) -> Result<u64, CliError> {
    let parsed = if let Some(hex) = input.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        input.parse()
    };

    parsed.map_err(|_| CliError::Parse(input.to_string()))
}

fn call(code: u64, arg0: u64, arg1: u64) -> u64 {
    let mut message = HypercallMessage::new(code);
    message.arg0 = arg0;
    message.arg1 = arg1;

    vmcall::issue(&mut message);
    message.result
}

fn run(args: &[String]) -> Result<(), CliError> {
    let words: Vec<&str> = args.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["stealth", "on"] => println!("{:#x}", call(hypercall::HC_STEALTH_ENABLE, 0, 0)),
        ["stealth", "off"] => println!("{:#x}", call(hypercall::HC_STEALTH_DISABLE, 0, 0)),

        ["cr3-cloak", "on"] => println!("{:#x}", call(hypercall::HC_CR3_CLOAK_ENABLE, 0, 0)),
        ["cr3-cloak", "off"] => println!("{:#x}", call(hypercall::HC_CR3_CLOAK_DISABLE, 0, 0)),

        ["read", gva] => {
            let value = call(hypercall::HC_READ_GVA, parse_u64(gva)?, 0);
            println!("{:#018x}", value);
        }

        ["write", gva, value] => {
            let status = call(hypercall::HC_WRITE_GVA, parse_u64(gva)?, parse_u64(value)?);
            println!("{:#x}", status);
        }

        ["translate", kind, address] => {
            let code = match *kind {
                "gva-gpa" => hypercall::HC_TRANSLATE_GVA_TO_GPA,
                "gva-hpa" => hypercall::HC_TRANSLATE_GVA_TO_HPA,
                "gpa-hpa" => hypercall::HC_TRANSLATE_GPA_TO_HPA,
                _ => return Err(CliError::Usage("translate gva-gpa|gva-hpa|gpa-hpa <address>")),
            };
            println!("{:#018x}", call(code, parse_u64(address)?, 0));
        }

        ["shadow-hook", "install", gva, hpa] => {
            let status = call(
                hypercall::HC_INSTALL_SHADOW_HOOK,
                parse_u64(gva)?,
                parse_u64(hpa)?,
            );
            println!("{:#x}", status);
        }

        ["shadow-hook", "clear"] => {
            println!("{:#x}", call(hypercall::HC_CLEAR_SHADOW_HOOK, 0, 0))
        }

        ["triggers", "arm", gva] => {
            println!("{:#x}", call(hypercall::HC_ARM_TRIGGERS, parse_u64(gva)?, 0))
        }

        ["triggers", "rearm"] => println!("{:#x}", call(hypercall::HC_REARM_TRIGGERS, 0, 0)),

        ["syscall-hook", "set", address] => {
            let status = call(hypercall::HC_SYSCALL_HOOK_SET_HANDLER, parse_u64(address)?, 0);
            println!("{:#x}", status);
        }

        ["syscall-hook", "on"] => {
            println!("{:#x}", call(hypercall::HC_SYSCALL_HOOK_ENABLE, 0, 0))
        }

        ["syscall-hook", "off"] => {
            println!("{:#x}", call(hypercall::HC_SYSCALL_HOOK_DISABLE, 0, 0))
        }

        ["mailbox", "pop"] => println!("{:#018x}", call(hypercall::HC_MAILBOX_POP, 0, 0)),

        ["mailbox", "push", code] => {
            println!("{:#x}", call(hypercall::HC_MAILBOX_PUSH, parse_u64(code)?, 0))
        }

        ["process", "base"] => {
            println!("{:#018x}", call(hypercall::HC_QUERY_CURRENT_PROCESS_BASE, 0, 0))
        }

        ["process", "base", pid] => {
            println!(
                "{:#018x}",
                call(hypercall::HC_QUERY_PROCESS_BASE, parse_u64(pid)?, 0)
            )
        }

        ["process", "dirbase", pid] => {
            println!(
                "{:#018x}",
                call(hypercall::HC_QUERY_PROCESS_DIRBASE, parse_u64(pid)?, 0)
            )
        }

        ["telemetry"] => {
            println!(
                "npf count:       {}",
                call(hypercall::HC_TELEMETRY_NPF_COUNT, 0, 0)
            );
            println!(
                "last unhandled:  {:#x}",
                call(hypercall::HC_TELEMETRY_LAST_UNHANDLED, 0, 0)
            );

            for (name, code) in [
                ("cpuid", 0x72u64),
                ("msr", 0x7C),
                ("vmmcall", 0x81),
                ("npf", 0x400),
            ] {
                println!(
                    "{:<8} exits:   {}",
                    name,
                    call(hypercall::HC_TELEMETRY_EXIT_COUNT, code, 0)
                );
            }
        }

        ["telemetry", "clear"] => {
            println!("{:#x}", call(hypercall::HC_TELEMETRY_CLEAR, 0, 0))
        }

        ["help"] | [] => println!("{}", HELP),

        _ => return Err(CliError::Usage("unknown command, see `hv-control help`")),
    }

    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if let Err(error) = run(&args) {
        eprintln!("{}", error);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(parse_u64("42").unwrap(), 42);
        assert_eq!(parse_u64("0x42").unwrap(), 0x42);
        assert_eq!(parse_u64("0xDEADBEEF").unwrap(), 0xDEAD_BEEF);
        assert!(parse_u64("nope").is_err());
        assert!(parse_u64("0xZZ").is_err());
    }
}
