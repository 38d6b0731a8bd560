use super::{Block, ConsoleDecoder, DecodeError};
use crate::source::RawLine;
use sha2::{Digest, Sha256};

const LINE_PREFIX: &str = "FIRE ";

/// Decoder for `FIRE`-prefixed console lines.
///
/// ```text
/// FIRE BLOCK <num> <payload>
/// FIRE BLOCK_BEGIN <num>
/// FIRE BLOCK_DATA <chunk>
/// FIRE BLOCK_END <num>
/// ```
///
/// Anything else the node prints is ignored.
#[derive(Debug, Default)]
pub struct FireConsoleDecoder {
    open: Option<OpenBlock>,
    last_hash: Option<String>,
}

#[derive(Debug)]
struct OpenBlock {
    number: u64,
    chunks: Vec<String>,
    begin_seq: u64,
}

impl FireConsoleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn seal(&mut self, number: u64, payload: String) -> Block {
        let hash = block_hash(number, &payload);
        let parent_hash = self.last_hash.replace(hash.clone());
        Block {
            number,
            hash,
            parent_hash,
            payload,
        }
    }
}

impl ConsoleDecoder for FireConsoleDecoder {
    fn decode(&mut self, line: &RawLine) -> Result<Option<Block>, DecodeError> {
        let Some(rest) = line.text.strip_prefix(LINE_PREFIX) else {
            return Ok(None);
        };

        let (directive, args) = rest.split_once(' ').unwrap_or((rest, ""));
        let seq = line.seq;

        match directive {
            "BLOCK" => {
                let (number, payload) = split_number(seq, args)?;
                if let Some(open) = &self.open {
                    return Err(DecodeError::Corrupted {
                        seq,
                        reason: format!(
                            "BLOCK {} while block {} (opened at line {}) is still open",
                            number, open.number, open.begin_seq
                        ),
                    });
                }
                Ok(Some(self.seal(number, payload.to_string())))
            }
            "BLOCK_BEGIN" => {
                let number = parse_number(seq, args.trim())?;
                if let Some(open) = &self.open {
                    return Err(DecodeError::Corrupted {
                        seq,
                        reason: format!(
                            "BLOCK_BEGIN {} while block {} is still open",
                            number, open.number
                        ),
                    });
                }
                self.open = Some(OpenBlock {
                    number,
                    chunks: Vec::new(),
                    begin_seq: seq,
                });
                Ok(None)
            }
            "BLOCK_DATA" => match &mut self.open {
                Some(open) => {
                    open.chunks.push(args.to_string());
                    Ok(None)
                }
                None => Err(DecodeError::Corrupted {
                    seq,
                    reason: "BLOCK_DATA without an open block".to_string(),
                }),
            },
            "BLOCK_END" => {
                let number = parse_number(seq, args.trim())?;
                let open = self.open.take().ok_or_else(|| DecodeError::Corrupted {
                    seq,
                    reason: format!("BLOCK_END {} without an open block", number),
                })?;
                if open.number != number {
                    return Err(DecodeError::Corrupted {
                        seq,
                        reason: format!(
                            "BLOCK_END {} does not match open block {}",
                            number, open.number
                        ),
                    });
                }
                Ok(Some(self.seal(number, open.chunks.join("\n"))))
            }
            other => Err(DecodeError::Malformed {
                seq,
                reason: format!("unknown directive '{}'", other),
            }),
        }
    }

    fn finish(&mut self) -> Result<(), DecodeError> {
        match self.open.take() {
            Some(open) => Err(DecodeError::Corrupted {
                seq: open.begin_seq,
                reason: format!("input ended inside block {}", open.number),
            }),
            None => Ok(()),
        }
    }
}

/// Lowercase hex SHA-256 of `"<number>:<payload>"`.
pub fn block_hash(number: u64, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(number.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn split_number(seq: u64, args: &str) -> Result<(u64, &str), DecodeError> {
    let (number, payload) = args.split_once(' ').unwrap_or((args, ""));
    Ok((parse_number(seq, number)?, payload))
}

fn parse_number(seq: u64, text: &str) -> Result<u64, DecodeError> {
    text.parse().map_err(|_| DecodeError::Malformed {
        seq,
        reason: format!("invalid block number '{}'", text),
    })
}
