//! Transaction wire codec: legacy and segwit forms, txid/wtxid, coinbase
//! shape and legacy sig-op counting.

use crate::codec::{ByteReader, ByteWriter, CodecError};
use crate::hash::{double_sha256, H256};

/// The marker byte that distinguishes a segwit serialization from a
/// legacy input count, and the only flag value ever defined for it.
const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

const OP_CHECKSIG: u8 = 0xAC;
const OP_CHECKSIGVERIFY: u8 = 0xAD;
const OP_CHECKMULTISIG: u8 = 0xAE;
const OP_CHECKMULTISIGVERIFY: u8 = 0xAF;
const OP_PUSHDATA1: u8 = 0x4C;
const OP_PUSHDATA2: u8 = 0x4D;
const OP_PUSHDATA4: u8 = 0x4E;

/// A reference to the output being spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: H256,
    pub vout: u32,
}

impl OutPoint {
    /// The distinguished outpoint a coinbase input carries.
    #[must_use]
    pub const fn null() -> OutPoint {
        OutPoint {
            txid: H256::ZERO,
            vout: u32::MAX,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        *self == OutPoint::null()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Witness stack for this input; empty for legacy spends. Not part of
    /// the txid preimage.
    pub witness: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    /// Amount in satoshis.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Decodes one transaction from the reader, leaving any trailing
    /// bytes unconsumed (a block parses many in sequence).
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Transaction, CodecError> {
        let version = reader.read_i32()?;

        // Segwit is signalled by a zero where the input count belongs;
        // a legacy transaction can never have zero inputs on the wire.
        let segwit = reader.peek_u8() == Some(SEGWIT_MARKER);
        if segwit {
            reader.read_u8()?;
            let flag = reader.read_u8()?;
            if flag != SEGWIT_FLAG {
                return Err(CodecError::Malformed("unknown segwit flag"));
            }
        }

        let input_count = reader.read_count()?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(read_input(reader)?);
        }

        let output_count = reader.read_count()?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(read_output(reader)?);
        }

        if segwit {
            let mut any_witness = false;
            for input in &mut inputs {
                let item_count = reader.read_count()?;
                let mut stack = Vec::with_capacity(item_count);
                for _ in 0..item_count {
                    stack.push(reader.read_var_bytes()?);
                }
                any_witness |= !stack.is_empty();
                input.witness = stack;
            }
            if !any_witness {
                return Err(CodecError::Malformed("segwit marker without witness data"));
            }
        }

        let lock_time = reader.read_u32()?;

        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Decodes a transaction that must span the whole buffer.
    pub fn parse(bytes: &[u8]) -> Result<Transaction, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let tx = Transaction::read(&mut reader)?;
        reader.expect_end()?;
        Ok(tx)
    }

    #[must_use]
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Serializes in the form the network would relay: segwit framing
    /// exactly when some input carries a witness.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        if self.has_witness() {
            self.serialize_with_witness()
        } else {
            self.serialize_base()
        }
    }

    /// The legacy serialization: no marker, flag or witness stacks. This
    /// is the txid preimage.
    #[must_use]
    pub fn serialize_base(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(self.base_size());
        self.write_base(&mut writer);
        writer.into_vec()
    }

    /// The full segwit serialization, marker and flag included.
    #[must_use]
    pub fn serialize_with_witness(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(self.total_size());
        writer.write_i32(self.version);
        writer.write_u8(SEGWIT_MARKER);
        writer.write_u8(SEGWIT_FLAG);
        self.write_inputs_outputs(&mut writer);
        for input in &self.inputs {
            writer.write_varint(input.witness.len() as u64);
            for item in &input.witness {
                writer.write_var_bytes(item);
            }
        }
        writer.write_u32(self.lock_time);
        writer.into_vec()
    }

    fn write_base(&self, writer: &mut ByteWriter) {
        writer.write_i32(self.version);
        self.write_inputs_outputs(writer);
        writer.write_u32(self.lock_time);
    }

    fn write_inputs_outputs(&self, writer: &mut ByteWriter) {
        writer.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            writer.write_hash(&input.previous_output.txid);
            writer.write_u32(input.previous_output.vout);
            writer.write_var_bytes(&input.script_sig);
            writer.write_u32(input.sequence);
        }
        writer.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            writer.write_u64(output.value);
            writer.write_var_bytes(&output.script_pubkey);
        }
    }

    /// The transaction id: double SHA-256 of the serialization without
    /// witness data, so it is stable whether or not witnesses are present.
    #[must_use]
    pub fn txid(&self) -> H256 {
        double_sha256(&self.serialize_base())
    }

    /// The witness transaction id: double SHA-256 of the full
    /// serialization. Equal to [`txid`](Self::txid) for legacy
    /// transactions.
    #[must_use]
    pub fn wtxid(&self) -> H256 {
        if self.has_witness() {
            double_sha256(&self.serialize_with_witness())
        } else {
            self.txid()
        }
    }

    /// A coinbase has exactly one input spending the null outpoint.
    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Serialized length without witness data.
    #[must_use]
    pub fn base_size(&self) -> usize {
        self.serialize_base().len()
    }

    /// Serialized length in the relayed form.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.serialize().len()
    }

    /// BIP141 weight: three times the base size plus the total size.
    #[must_use]
    pub fn weight(&self) -> usize {
        self.base_size() * 3 + self.total_size()
    }

    /// Legacy sig-op count over all input and output scripts, the measure
    /// the block-level cap is defined in.
    #[must_use]
    pub fn sigop_count(&self) -> u32 {
        let inputs = self.inputs.iter().map(|i| count_sigops(&i.script_sig));
        let outputs = self.outputs.iter().map(|o| count_sigops(&o.script_pubkey));
        inputs.chain(outputs).sum()
    }
}

fn read_input(reader: &mut ByteReader<'_>) -> Result<TxIn, CodecError> {
    let txid = reader.read_hash()?;
    let vout = reader.read_u32()?;
    let script_sig = reader.read_var_bytes()?;
    let sequence = reader.read_u32()?;
    Ok(TxIn {
        previous_output: OutPoint { txid, vout },
        script_sig,
        sequence,
        witness: Vec::new(),
    })
}

fn read_output(reader: &mut ByteReader<'_>) -> Result<TxOut, CodecError> {
    let value = reader.read_u64()?;
    let script_pubkey = reader.read_var_bytes()?;
    Ok(TxOut {
        value,
        script_pubkey,
    })
}

/// Counts CHECKSIG-family operations in a script, skipping push data.
/// A script that ends mid-push contributes whatever was counted before
/// the malformed tail, as the reference counter does.
fn count_sigops(script: &[u8]) -> u32 {
    let mut count = 0;
    let mut i = 0;
    while i < script.len() {
        let opcode = script[i];
        i += 1;
        match opcode {
            0x01..=0x4B => i += opcode as usize,
            OP_PUSHDATA1 => {
                let Some(&len) = script.get(i) else { break };
                i += 1 + len as usize;
            }
            OP_PUSHDATA2 => {
                let Some(bytes) = script.get(i..i + 2) else { break };
                i += 2 + u16::from_le_bytes(bytes.try_into().unwrap()) as usize;
            }
            OP_PUSHDATA4 => {
                let Some(bytes) = script.get(i..i + 4) else { break };
                i += 4 + u32::from_le_bytes(bytes.try_into().unwrap()) as usize;
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => count += 20,
            _ => {}
        }
    }
    count
}
