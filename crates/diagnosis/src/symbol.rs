//! Program-counter to function-name lookup for `/pprof/symbol`.
//!
//! Request bodies (or query strings) carry addresses joined with `+`, each
//! either `0x`-prefixed hex or decimal. The reply always starts with
//! `num_symbols: 1` so pprof clients know symbolization is available, followed
//! by one `0x<addr> <name>` line per address that resolved.

use std::fmt::Write;

/// Splits `0x1f+0x2a+17` into addresses, skipping anything unparsable or zero.
pub fn parse_addresses(input: &str) -> Vec<u64> {
    input
        .split('+')
        .filter_map(|word| {
            let word = word.trim();
            let parsed = match word
                .strip_prefix("0x")
                .or_else(|| word.strip_prefix("0X"))
            {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => word.parse::<u64>().ok(),
            };
            parsed.filter(|&pc| pc != 0)
        })
        .collect()
}

/// Resolves a single address to the innermost symbol name, demangled.
pub fn resolve(pc: u64) -> Option<String> {
    let mut name = None;
    backtrace::resolve(pc as usize as *mut std::ffi::c_void, |symbol| {
        if name.is_none() {
            name = symbol.name().map(|n| format!("{:#}", n));
        }
    });
    name
}

pub fn render(input: &str) -> String {
    let mut out = String::from("num_symbols: 1\n");
    for pc in parse_addresses(input) {
        if let Some(name) = resolve(pc) {
            let _ = writeln!(out, "{:#x} {}", pc, name);
        }
    }
    out
}
