//! Minimal script interpreter covering the opcodes collateral scripts use.
//!
//! Signatures are checked against the real BIP143 / legacy digest of the
//! spending transaction, so a passing input would also pass consensus for
//! these opcodes. Standardness rules enforced: MINIMALIF and CLEANSTACK for
//! witness spends, NULLDUMMY for CHECKMULTISIG.

use bitcoin::ecdsa;
use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::opcodes::all::*;
use bitcoin::opcodes::Opcode;
use bitcoin::script::Instruction;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::{PublicKey, Script, ScriptBuf, Sequence, Transaction, TxOut};

const LOCKTIME_THRESHOLD: i64 = 500_000_000;

struct Context<'a> {
    tx: &'a Transaction,
    index: usize,
    prevout: &'a TxOut,
    segwit: bool,
}

/// Verify input `index` of `tx` against the output it spends.
pub fn verify_input(tx: &Transaction, index: usize, prevout: &TxOut) -> Result<(), String> {
    let input = tx.input.get(index).ok_or("no such input")?;
    let spk = &prevout.script_pubkey;

    if spk.is_p2wsh() {
        if !input.script_sig.is_empty() {
            return Err("native witness spend with scriptSig".into());
        }
        return verify_witness(tx, index, prevout, spk);
    }

    if spk.is_p2sh() {
        let mut pushes = push_only(&input.script_sig)?;
        let redeem = ScriptBuf::from_bytes(pushes.pop().ok_or("empty scriptSig")?);
        if ScriptBuf::new_p2sh(&redeem.script_hash()) != *spk {
            return Err("redeem script does not match P2SH hash".into());
        }
        if redeem.is_p2wsh() {
            if !pushes.is_empty() {
                return Err("wrapped witness spend with extra scriptSig items".into());
            }
            return verify_witness(tx, index, prevout, &redeem);
        }
        let ctx = Context {
            tx,
            index,
            prevout,
            segwit: false,
        };
        let stack = execute(&redeem, pushes, &ctx)?;
        return match stack.last() {
            Some(top) if truthy(top) => Ok(()),
            _ => Err("script evaluated to false".into()),
        };
    }

    Err("unsupported output type".into())
}

fn verify_witness(tx: &Transaction, index: usize, prevout: &TxOut, program: &Script) -> Result<(), String> {
    let mut items: Vec<Vec<u8>> = tx.input[index].witness.iter().map(|i| i.to_vec()).collect();
    let script = ScriptBuf::from_bytes(items.pop().ok_or("empty witness")?);
    if ScriptBuf::new_p2wsh(&script.wscript_hash()).as_script() != program {
        return Err("witness script does not match program".into());
    }
    let ctx = Context {
        tx,
        index,
        prevout,
        segwit: true,
    };
    let stack = execute(&script, items, &ctx)?;
    if stack.len() != 1 {
        return Err(format!("CLEANSTACK: {} items left", stack.len()));
    }
    if !truthy(&stack[0]) {
        return Err("script evaluated to false".into());
    }
    Ok(())
}

fn push_only(script: &Script) -> Result<Vec<Vec<u8>>, String> {
    script
        .instructions()
        .map(|ins| match ins.map_err(|e| e.to_string())? {
            Instruction::PushBytes(bytes) => Ok(bytes.as_bytes().to_vec()),
            Instruction::Op(op) if op == OP_PUSHNUM_1 => Ok(vec![1]),
            Instruction::Op(op) => Err(format!("non-push opcode {} in scriptSig", op)),
        })
        .collect()
}

fn execute(script: &Script, mut stack: Vec<Vec<u8>>, ctx: &Context) -> Result<Vec<Vec<u8>>, String> {
    let mut exec: Vec<bool> = Vec::new();

    for ins in script.instructions() {
        let executing = exec.iter().all(|b| *b);
        let op = match ins.map_err(|e| e.to_string())? {
            Instruction::PushBytes(bytes) => {
                if executing {
                    stack.push(bytes.as_bytes().to_vec());
                }
                continue;
            }
            Instruction::Op(op) => op,
        };

        if op == OP_IF {
            let value = if executing {
                let top = pop(&mut stack)?;
                if ctx.segwit && !(top.is_empty() || top == [1]) {
                    return Err("MINIMALIF".into());
                }
                truthy(&top)
            } else {
                false
            };
            exec.push(value);
            continue;
        }
        if op == OP_ELSE {
            let last = exec.last_mut().ok_or("ELSE without IF")?;
            *last = !*last;
            continue;
        }
        if op == OP_ENDIF {
            exec.pop().ok_or("ENDIF without IF")?;
            continue;
        }
        if !executing {
            continue;
        }

        step(op, &mut stack, ctx, script)?;
    }

    if !exec.is_empty() {
        return Err("unbalanced conditional".into());
    }
    Ok(stack)
}

fn step(op: Opcode, stack: &mut Vec<Vec<u8>>, ctx: &Context, script: &Script) -> Result<(), String> {
    let code = op.to_u8();
    if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&code) {
        stack.push(encode_num((code - OP_PUSHNUM_1.to_u8() + 1) as i64));
    } else if op == OP_SIZE {
        let len = stack.last().ok_or("SIZE on empty stack")?.len();
        stack.push(encode_num(len as i64));
    } else if op == OP_EQUAL {
        let (a, b) = (pop(stack)?, pop(stack)?);
        stack.push(encode_bool(a == b));
    } else if op == OP_EQUALVERIFY {
        let (a, b) = (pop(stack)?, pop(stack)?);
        if a != b {
            return Err("EQUALVERIFY failed".into());
        }
    } else if op == OP_VERIFY {
        if !truthy(&pop(stack)?) {
            return Err("VERIFY failed".into());
        }
    } else if op == OP_SWAP {
        let n = stack.len();
        if n < 2 {
            return Err("SWAP needs two items".into());
        }
        stack.swap(n - 1, n - 2);
    } else if op == OP_DUP {
        let top = stack.last().ok_or("DUP on empty stack")?.clone();
        stack.push(top);
    } else if op == OP_DROP {
        pop(stack)?;
    } else if op == OP_SHA256 {
        let data = pop(stack)?;
        stack.push(sha256::Hash::hash(&data).to_byte_array().to_vec());
    } else if op == OP_HASH160 {
        let data = pop(stack)?;
        stack.push(hash160::Hash::hash(&data).to_byte_array().to_vec());
    } else if op == OP_ADD || op == OP_GREATERTHANOREQUAL || op == OP_LESSTHANOREQUAL {
        let b = decode_num(&pop(stack)?, 4)?;
        let a = decode_num(&pop(stack)?, 4)?;
        stack.push(if op == OP_ADD {
            encode_num(a + b)
        } else if op == OP_GREATERTHANOREQUAL {
            encode_bool(a >= b)
        } else {
            encode_bool(a <= b)
        });
    } else if op == OP_CLTV {
        let required = decode_num(stack.last().ok_or("CLTV on empty stack")?, 5)?;
        let locktime = ctx.tx.lock_time.to_consensus_u32() as i64;
        if required < 0 {
            return Err("negative locktime".into());
        }
        if (required < LOCKTIME_THRESHOLD) != (locktime < LOCKTIME_THRESHOLD) {
            return Err("locktime type mismatch".into());
        }
        if required > locktime {
            return Err(format!("CLTV: locktime {} before {}", locktime, required));
        }
        if ctx.tx.input[ctx.index].sequence == Sequence::MAX {
            return Err("CLTV: input is final".into());
        }
    } else if op == OP_CHECKSIG {
        let pubkey = pop(stack)?;
        let sig = pop(stack)?;
        stack.push(encode_bool(check_sig(&sig, &pubkey, ctx, script)));
    } else if op == OP_CHECKMULTISIG {
        let n = decode_num(&pop(stack)?, 4)? as usize;
        let keys: Vec<Vec<u8>> = (0..n).map(|_| pop(stack)).collect::<Result<_, _>>()?;
        let m = decode_num(&pop(stack)?, 4)? as usize;
        let sigs: Vec<Vec<u8>> = (0..m).map(|_| pop(stack)).collect::<Result<_, _>>()?;
        if !pop(stack)?.is_empty() {
            return Err("NULLDUMMY".into());
        }
        // Both lists start from the last pushed item.
        let (mut isig, mut ikey) = (0, 0);
        while isig < sigs.len() {
            if sigs.len() - isig > keys.len() - ikey {
                break;
            }
            if check_sig(&sigs[isig], &keys[ikey], ctx, script) {
                isig += 1;
            }
            ikey += 1;
        }
        stack.push(encode_bool(isig == sigs.len()));
    } else {
        return Err(format!("unsupported opcode {}", op));
    }
    Ok(())
}

fn check_sig(sig: &[u8], pubkey: &[u8], ctx: &Context, script: &Script) -> bool {
    let Ok(sig) = ecdsa::Signature::from_slice(sig) else {
        return false;
    };
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let mut cache = SighashCache::new(ctx.tx);
    let digest = if ctx.segwit {
        match cache.p2wsh_signature_hash(ctx.index, script, ctx.prevout.value, sig.sighash_type) {
            Ok(h) => h.to_byte_array(),
            Err(_) => return false,
        }
    } else {
        match cache.legacy_signature_hash(ctx.index, script, sig.sighash_type.to_u32()) {
            Ok(h) => h.to_byte_array(),
            Err(_) => return false,
        }
    };
    Secp256k1::verification_only()
        .verify_ecdsa(&Message::from_digest(digest), &sig.signature, &pubkey.inner)
        .is_ok()
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, String> {
    stack.pop().ok_or_else(|| "stack underflow".to_string())
}

fn truthy(item: &[u8]) -> bool {
    item.iter().enumerate().any(|(i, b)| {
        if i == item.len() - 1 {
            *b & 0x7f != 0
        } else {
            *b != 0
        }
    })
}

fn encode_bool(b: bool) -> Vec<u8> {
    if b {
        vec![1]
    } else {
        Vec::new()
    }
}

fn encode_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out[out.len() - 1] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    out
}

fn decode_num(bytes: &[u8], max_len: usize) -> Result<i64, String> {
    if bytes.len() > max_len {
        return Err("script number overflow".into());
    }
    if bytes.is_empty() {
        return Ok(0);
    }
    let mut value: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as i64) << (8 * i);
    }
    let sign_bit = 0x80_i64 << (8 * (bytes.len() - 1));
    if value & sign_bit != 0 {
        Ok(-(value & !sign_bit))
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_encoding() {
        for n in [0, 1, 2, 16, 32, 127, 128, 255, 256, -1, -128, 1_700_000_000] {
            assert_eq!(decode_num(&encode_num(n), 5).unwrap(), n);
        }
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert!(!truthy(&[0x00, 0x80]));
        assert!(truthy(&[0x00, 0x01]));
    }
}
