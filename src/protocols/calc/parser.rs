//! Calculator frame parser and evaluator.

use bytes::{Buf, BufMut};

/// Size of a request or response frame in bytes.
pub const FRAME_LEN: usize = 5 * std::mem::size_of::<i32>();

/// Supported arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
}

impl Operator {
    /// Decode the operator field. Only the low byte is significant, so
    /// `0x12B` reads as `+`.
    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw as u8 {
            b'+' => Some(Operator::Add),
            b'-' => Some(Operator::Sub),
            b'*' => Some(Operator::Mul),
            b'/' => Some(Operator::Div),
            _ => None,
        }
    }

    /// Wire encoding of the operator.
    pub fn to_wire(self) -> i32 {
        let c = match self {
            Operator::Add => b'+',
            Operator::Sub => b'-',
            Operator::Mul => b'*',
            Operator::Div => b'/',
        };
        i32::from(c)
    }

    /// Apply the operator. `None` when the operation is impossible.
    pub fn apply(self, op1: i32, op2: i32) -> Option<i32> {
        match self {
            Operator::Add => Some(op1.wrapping_add(op2)),
            Operator::Sub => Some(op1.wrapping_sub(op2)),
            Operator::Mul => Some(op1.wrapping_mul(op2)),
            Operator::Div if op2 == 0 => None,
            Operator::Div => Some(op1.wrapping_div(op2)),
        }
    }
}

/// A calculator frame, used for both requests and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    pub op1: i32,
    pub op2: i32,
    pub result: i32,
    pub operator: i32,
    pub status: i32,
}

impl Frame {
    /// Build a request frame.
    pub fn request(op1: i32, op2: i32, operator: Operator) -> Self {
        Frame {
            op1,
            op2,
            operator: operator.to_wire(),
            ..Frame::default()
        }
    }

    /// Decode a frame from the first `FRAME_LEN` bytes of `input`.
    ///
    /// The caller must ensure enough bytes are present.
    fn decode(mut input: &[u8]) -> Self {
        Frame {
            op1: input.get_i32(),
            op2: input.get_i32(),
            result: input.get_i32(),
            operator: input.get_i32(),
            status: input.get_i32(),
        }
    }

    /// Append the network byte order encoding of the frame to `output`.
    pub fn encode<B: BufMut>(&self, output: &mut B) {
        output.put_i32(self.op1);
        output.put_i32(self.op2);
        output.put_i32(self.result);
        output.put_i32(self.operator);
        output.put_i32(self.status);
    }

    /// Encode the frame into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }

    /// Whether the server reported success.
    pub fn is_ok(&self) -> bool {
        self.status == 1
    }
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A full frame with bytes consumed.
    Complete(Frame, usize),
    /// Need more data.
    Incomplete,
}

/// Parse one request frame from the input buffer.
pub fn parse(input: &[u8]) -> ParseResult {
    if input.len() < FRAME_LEN {
        return ParseResult::Incomplete;
    }
    ParseResult::Complete(Frame::decode(&input[..FRAME_LEN]), FRAME_LEN)
}

/// Compute the response for a request frame.
///
/// Operands and operator are echoed back; `result` and `status` are
/// overwritten.
pub fn evaluate(request: Frame) -> Frame {
    let outcome = Operator::from_wire(request.operator).and_then(|op| op.apply(request.op1, request.op2));

    Frame {
        result: outcome.unwrap_or(0),
        status: i32::from(outcome.is_some()),
        ..request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_division() {
        let response = evaluate(Frame::request(6, 3, Operator::Div));
        assert_eq!(response.result, 2);
        assert_eq!(response.status, 1);
        assert_eq!(response.op1, 6);
        assert_eq!(response.op2, 3);
        assert_eq!(response.operator, i32::from(b'/'));
    }

    #[test]
    fn test_division_by_zero() {
        let response = evaluate(Frame::request(5, 0, Operator::Div));
        assert_eq!(response.status, 0);
        assert_eq!(response.result, 0);
    }

    #[test]
    fn test_all_operators() {
        assert_eq!(evaluate(Frame::request(7, 5, Operator::Add)).result, 12);
        assert_eq!(evaluate(Frame::request(7, 5, Operator::Sub)).result, 2);
        assert_eq!(evaluate(Frame::request(-7, 5, Operator::Mul)).result, -35);
        assert_eq!(evaluate(Frame::request(-7, 2, Operator::Div)).result, -3);
    }

    #[test]
    fn test_wrapping_arithmetic() {
        let response = evaluate(Frame::request(i32::MAX, 1, Operator::Add));
        assert_eq!(response.result, i32::MIN);
        assert!(response.is_ok());

        let response = evaluate(Frame::request(i32::MIN, -1, Operator::Div));
        assert_eq!(response.result, i32::MIN);
        assert!(response.is_ok());

        let response = evaluate(Frame::request(0x10000, 0x10000, Operator::Mul));
        assert_eq!(response.result, 0);
    }

    #[test]
    fn test_unknown_operator() {
        let request = Frame {
            op1: 1,
            op2: 2,
            operator: i32::from(b'%'),
            ..Frame::default()
        };
        assert_eq!(evaluate(request).status, 0);

        // High bytes are ignored.
        let request = Frame {
            op1: 1,
            op2: 2,
            operator: 0x100 + i32::from(b'+'),
            ..Frame::default()
        };
        let response = evaluate(request);
        assert_eq!(response.status, 1);
        assert_eq!(response.result, 3);
        assert_eq!(response.operator, 0x12B);

        let request = Frame {
            op1: 1,
            op2: 2,
            operator: 0x100 + i32::from(b'%'),
            ..Frame::default()
        };
        assert_eq!(evaluate(request).status, 0);
    }

    #[test]
    fn test_parse_network_order() {
        let bytes = [
            0, 0, 0, 6, // op1
            0, 0, 0, 3, // op2
            0, 0, 0, 0, // result
            0, 0, 0, b'/', // operator
            0, 0, 0, 0, // status
        ];
        match parse(&bytes) {
            ParseResult::Complete(frame, FRAME_LEN) => {
                assert_eq!(frame, Frame::request(6, 3, Operator::Div));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        let bytes = Frame::request(1, 2, Operator::Add).to_bytes();
        assert_eq!(parse(&bytes[..FRAME_LEN - 1]), ParseResult::Incomplete);
        assert_eq!(parse(&[]), ParseResult::Incomplete);
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame {
            op1: 1,
            op2: -1,
            result: 0x01020304,
            operator: i32::from(b'*'),
            status: 1,
        };
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&bytes[8..12], &[1, 2, 3, 4]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, b'*']);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 1]);
    }
}
