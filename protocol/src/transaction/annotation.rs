//! Reading transactions back off the ledger: consensus decoding, mailbox
//! matching and OP_RETURN extraction.

use bitcoin::script::Instruction;
use bitcoin::{Script, Transaction};

/// Decodes consensus-encoded transaction hex. `None` on any malformation.
pub fn decode_transaction_hex(raw_hex: &str) -> Option<Transaction> {
    let bytes = hex::decode(raw_hex.trim()).ok()?;
    bitcoin::consensus::deserialize(&bytes).ok()
}

/// Whether any output of `tx` is locked to `script`.
pub fn pays_to(tx: &Transaction, script: &Script) -> bool {
    tx.output
        .iter()
        .any(|out| out.script_pubkey.as_script() == script)
}

/// The data carried by the first OP_RETURN output that holds any.
///
/// Multiple pushes after `OP_RETURN` are concatenated. An OP_RETURN followed
/// by anything other than pushes (or by nothing) carries no annotation.
pub fn annotation_bytes(tx: &Transaction) -> Option<Vec<u8>> {
    tx.output
        .iter()
        .filter(|out| out.script_pubkey.is_op_return())
        .find_map(|out| {
            let mut data = Vec::new();
            for instruction in out.script_pubkey.instructions().skip(1) {
                match instruction {
                    Ok(Instruction::PushBytes(bytes)) => data.extend_from_slice(bytes.as_bytes()),
                    _ => return None,
                }
            }
            (!data.is_empty()).then_some(data)
        })
}

/// The annotation as text, if it is non-empty valid UTF-8.
pub fn annotation_text(tx: &Transaction) -> Option<String> {
    let bytes = annotation_bytes(tx)?;
    let text = String::from_utf8(bytes).ok()?;
    (!text.trim().is_empty()).then_some(text)
}
