//! Canonical prefix-code trees for the VP8L entropy decoder.
//!
//! A tree is rebuilt from a code-length list alone: lengths are turned into
//! canonical codes (sorted by `(length, symbol)`, sequential assignment) and
//! inserted into a binary tree that the bit reader walks one bit at a time.

use crate::decoder::DecodingError;
use crate::lossless::BitReader;

const MAX_CODE_LENGTH: u16 = 15;

#[derive(Debug, Clone, Copy)]
pub(crate) enum HuffmanTreeNode {
    /// Offset of the zero child; the one child is adjacent.
    Branch(usize),
    Leaf(u16),
    Empty,
}

/// A decoded prefix code over one alphabet.
///
/// The single-symbol form is carried as an explicit variant: reading from it
/// consumes no bits, which is how the wire format's one-symbol "simple code"
/// behaves.
#[derive(Debug, Clone)]
pub(crate) enum HuffmanTree {
    Single(u16),
    Tree(Vec<HuffmanTreeNode>),
}

impl HuffmanTree {
    /// A code whose alphabet has exactly one used symbol.
    pub(crate) fn build_single(symbol: u16) -> Self {
        HuffmanTree::Single(symbol)
    }

    /// A two-symbol code: one bit each, zero then one.
    pub(crate) fn build_pair(zero: u16, one: u16) -> Result<Self, DecodingError> {
        let mut nodes = vec![HuffmanTreeNode::Empty];
        insert(&mut nodes, zero, 0b0, 1)?;
        insert(&mut nodes, one, 0b1, 1)?;
        Ok(HuffmanTree::Tree(nodes))
    }

    /// Rebuilds a tree from per-symbol code lengths (0 = unused).
    pub(crate) fn build_explicit(code_lengths: &[u16]) -> Result<Self, DecodingError> {
        let mut num_symbols = 0;
        let mut last_symbol = 0;
        for (symbol, &len) in code_lengths.iter().enumerate() {
            if len > MAX_CODE_LENGTH {
                return Err(DecodingError::InvalidHuffmanTree);
            }
            if len > 0 {
                num_symbols += 1;
                last_symbol = symbol as u16;
            }
        }
        match num_symbols {
            0 => Err(DecodingError::InvalidHuffmanTree),
            1 => Ok(HuffmanTree::Single(last_symbol)),
            _ => {
                let mut nodes = vec![HuffmanTreeNode::Empty];
                for (symbol, code, len) in canonical_codes(code_lengths) {
                    insert(&mut nodes, symbol, code, len)?;
                }
                Ok(HuffmanTree::Tree(nodes))
            }
        }
    }

    /// Decodes the next symbol. Walks the tree bit by bit; a walk that runs
    /// into an unassigned slot means the code lengths did not describe a
    /// complete prefix code.
    pub(crate) fn read_symbol(&self, r: &mut BitReader) -> Result<u16, DecodingError> {
        match self {
            HuffmanTree::Single(symbol) => Ok(*symbol),
            HuffmanTree::Tree(nodes) => {
                let mut index = 0;
                loop {
                    match nodes[index] {
                        HuffmanTreeNode::Leaf(symbol) => return Ok(symbol),
                        HuffmanTreeNode::Empty => return Err(DecodingError::InvalidHuffmanTree),
                        HuffmanTreeNode::Branch(children) => {
                            index = children + r.read_bits(1)? as usize;
                        }
                    }
                }
            }
        }
    }
}

/// Canonical code assignment: count lengths, derive the first code of each
/// length, then hand out sequential codes in symbol order.
fn canonical_codes(code_lengths: &[u16]) -> Vec<(u16, u16, u16)> {
    let mut count = [0u16; MAX_CODE_LENGTH as usize + 1];
    for &len in code_lengths {
        count[len as usize] += 1;
    }
    // length 0 never allocates codes
    count[0] = 0;

    let mut next_code = [0u16; MAX_CODE_LENGTH as usize + 1];
    let mut code = 0u16;
    for len in 1..=MAX_CODE_LENGTH as usize {
        code = (code + count[len - 1]) << 1;
        next_code[len] = code;
    }

    let mut out = Vec::new();
    for (symbol, &len) in code_lengths.iter().enumerate() {
        if len > 0 {
            out.push((symbol as u16, next_code[len as usize], len));
            next_code[len as usize] += 1;
        }
    }
    out
}

fn insert(
    nodes: &mut Vec<HuffmanTreeNode>,
    symbol: u16,
    code: u16,
    len: u16,
) -> Result<(), DecodingError> {
    let mut index = 0;
    for depth in 0..len {
        let bit = (code >> (len - 1 - depth)) & 1;
        match nodes[index] {
            HuffmanTreeNode::Leaf(_) => return Err(DecodingError::InvalidHuffmanTree),
            HuffmanTreeNode::Branch(children) => index = children + bit as usize,
            HuffmanTreeNode::Empty => {
                let children = nodes.len();
                nodes[index] = HuffmanTreeNode::Branch(children);
                nodes.push(HuffmanTreeNode::Empty);
                nodes.push(HuffmanTreeNode::Empty);
                index = children + bit as usize;
            }
        }
    }
    match nodes[index] {
        HuffmanTreeNode::Empty => {
            nodes[index] = HuffmanTreeNode::Leaf(symbol);
            Ok(())
        }
        // A longer code already claimed this slot as a branch, or two codes
        // collided outright.
        _ => Err(DecodingError::InvalidHuffmanTree),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lossless::BitReader;

    #[test]
    fn canonical_codes_are_unique() {
        let lengths = [2, 2, 2, 3, 3, 0, 4, 4];
        let codes = canonical_codes(&lengths);
        for (i, &(_, code_i, len_i)) in codes.iter().enumerate() {
            for &(_, code_j, len_j) in &codes[i + 1..] {
                assert!(code_i != code_j || len_i != len_j);
            }
        }
    }

    #[test]
    fn single_symbol_consumes_no_bits() {
        let tree = HuffmanTree::build_explicit(&[0, 0, 0, 1]).unwrap();
        let mut r = BitReader::new(vec![]);
        // No input bytes at all, yet the symbol decodes.
        assert_eq!(tree.read_symbol(&mut r).unwrap(), 3);
    }

    #[test]
    fn pair_decodes_one_bit_per_symbol() {
        let tree = HuffmanTree::build_pair(7, 200).unwrap();
        let mut r = BitReader::new(vec![0b0000_0010]);
        assert_eq!(tree.read_symbol(&mut r).unwrap(), 7);
        assert_eq!(tree.read_symbol(&mut r).unwrap(), 200);
    }

    #[test]
    fn oversubscribed_lengths_are_rejected() {
        // Three codes of length one cannot coexist.
        let err = HuffmanTree::build_explicit(&[1, 1, 1]).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidHuffmanTree));
    }

    #[test]
    fn kraft_sum_of_built_codes_is_valid() {
        let lengths = [3, 3, 3, 3, 3, 2, 4, 4];
        let codes = canonical_codes(&lengths);
        let sum: u32 = codes.iter().map(|&(_, _, len)| 1u32 << (15 - len)).sum();
        assert!(sum <= 1 << 15);
    }

    #[test]
    fn decodes_canonical_stream() {
        // Symbols 0..4 with lengths [2,2,2,3,3]: codes 00,01,10,110,111.
        let tree = HuffmanTree::build_explicit(&[2, 2, 2, 3, 3]).unwrap();
        // The encoder writes codes bit-reversed, LSB first; feed the reader
        // the on-wire order for symbols 2, 4.
        // symbol 2 = code 10 -> wire bits 1,0; symbol 4 = 111 -> 1,1,1.
        let mut r = BitReader::new(vec![0b0001_1101]);
        assert_eq!(tree.read_symbol(&mut r).unwrap(), 2);
        assert_eq!(tree.read_symbol(&mut r).unwrap(), 4);
    }
}
