//! x64 disassembly for logs and tests.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

fn formatter() -> IntelFormatter {
    let mut formatter = IntelFormatter::new();
    let opts = formatter.options_mut();
    opts.set_space_after_operand_separator(true);
    opts.set_hex_prefix("0x");
    opts.set_hex_suffix("");
    opts.set_uppercase_hex(false);
    opts.set_small_hex_numbers_in_decimal(false);
    opts.set_uppercase_keywords(false);
    opts.set_space_between_memory_add_operators(true);
    opts.set_memory_size_options(iced_x86::MemorySizeOptions::Always);
    formatter
}

/// Disassemble `code`, which starts at address `ip`, into one string per instruction.
pub fn disassemble(code: &[u8], ip: u64) -> Vec<String> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut formatter = formatter();
    let mut instruction = Instruction::default();
    let mut out = Vec::new();
    let mut s = String::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        s.clear();
        formatter.format(&instruction, &mut s);
        out.push(s.clone());
    }
    out
}

/// As [disassemble], but with each instruction prefixed by its address, one per line.
pub fn disassemble_with_addresses(code: &[u8], ip: u64) -> String {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut formatter = formatter();
    let mut instruction = Instruction::default();
    let mut out = String::new();
    let mut s = String::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        s.clear();
        formatter.format(&instruction, &mut s);
        out.push_str(&format!("{:x}: {s}\n", instruction.ip()));
    }
    out
}
