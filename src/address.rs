//! Address Encoding
//!
//! Wraps control programs into segwit addresses for display and decodes them
//! back into program bytes.

use std::str::FromStr;

use bitcoin::{Address, Network, Script, ScriptBuf};
use thiserror::Error;

/// Errors for address encoding and decoding
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("program is not a witness program: {0}")]
    NotWitnessProgram(String),

    #[error("program has no address form: {0}")]
    UnrecognizedProgram(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Encode a witness program as an address on `network`
pub fn encode(program: &Script, network: Network) -> Result<String, EncodingError> {
    if !program.is_witness_program() {
        return Err(EncodingError::NotWitnessProgram(hex::encode(program.as_bytes())));
    }

    let address = Address::from_script(program, network)
        .map_err(|e| EncodingError::UnrecognizedProgram(e.to_string()))?;

    Ok(address.to_string())
}

/// Decode an address for `network` back into its program bytes
pub fn decode(address: &str, network: Network) -> Result<ScriptBuf, EncodingError> {
    let address = Address::from_str(address)
        .map_err(|e| EncodingError::InvalidAddress(e.to_string()))?
        .require_network(network)
        .map_err(|e| EncodingError::InvalidAddress(e.to_string()))?;

    let program = address.script_pubkey();
    if !program.is_witness_program() {
        return Err(EncodingError::NotWitnessProgram(address.to_string()));
    }

    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2wpkh(fill: u8) -> ScriptBuf {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend_from_slice(&[fill; 20]);
        ScriptBuf::from_bytes(bytes)
    }

    fn p2wsh(fill: u8) -> ScriptBuf {
        let mut bytes = vec![0x00, 0x20];
        bytes.extend_from_slice(&[fill; 32]);
        ScriptBuf::from_bytes(bytes)
    }

    #[test]
    fn test_encode_decode_p2wpkh() {
        let program = p2wpkh(0x11);
        let address = encode(&program, Network::Testnet).unwrap();

        assert!(address.starts_with("tb1q"));
        assert_eq!(decode(&address, Network::Testnet).unwrap(), program);
    }

    #[test]
    fn test_encode_decode_p2wsh() {
        let program = p2wsh(0x22);
        let address = encode(&program, Network::Bitcoin).unwrap();

        assert!(address.starts_with("bc1q"));
        assert_eq!(decode(&address, Network::Bitcoin).unwrap(), program);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let program = p2wpkh(0x33);
        assert_eq!(
            encode(&program, Network::Regtest).unwrap(),
            encode(&program, Network::Regtest).unwrap()
        );
    }

    #[test]
    fn test_non_witness_program_rejected() {
        // OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
        let mut bytes = vec![0x76, 0xa9, 0x14];
        bytes.extend_from_slice(&[0x44; 20]);
        bytes.extend_from_slice(&[0x88, 0xac]);
        let p2pkh = ScriptBuf::from_bytes(bytes);

        assert!(matches!(
            encode(&p2pkh, Network::Testnet),
            Err(EncodingError::NotWitnessProgram(_))
        ));
        assert!(matches!(
            encode(&ScriptBuf::new(), Network::Testnet),
            Err(EncodingError::NotWitnessProgram(_))
        ));
    }

    #[test]
    fn test_decode_wrong_network_rejected() {
        let address = encode(&p2wpkh(0x55), Network::Bitcoin).unwrap();
        assert!(matches!(
            decode(&address, Network::Testnet),
            Err(EncodingError::InvalidAddress(_))
        ));
        assert!(matches!(
            decode("not-an-address", Network::Testnet),
            Err(EncodingError::InvalidAddress(_))
        ));
    }
}
