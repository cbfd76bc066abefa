use crate::vte_actions::VteAction::{
    Backspace, CarriageReturn, CursorBackward, CursorForward, EraseInLine, LineFeed, Tab, Text,
};
use vte::{Params, Parser, Perform};

/// The semantic actions within a single captured line that affect what it
/// shows once painted.
#[derive(Debug, PartialEq, Eq)]
pub enum VteAction {
    Text(char),
    Tab,
    Backspace,
    LineFeed,
    CarriageReturn,
    CursorForward(u16),
    CursorBackward(u16),
    EraseInLine(u16),
}

/// A wrapper over [Parser] and [Perform] which takes bytes in and exposes the
/// semantic actions they contain. Colors and other styling are dropped.
pub struct VteActionParser {
    parser: Parser,
}

impl VteActionParser {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
        }
    }

    pub fn parse_bytes(&mut self, bytes: &[u8]) -> Vec<VteAction> {
        let mut performer = Performer::new();
        for byte in bytes {
            self.parser.advance(&mut performer, *byte)
        }
        performer.actions
    }
}

impl Default for VteActionParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders `bytes` the way a terminal would show them on one row: escape
/// sequences are interpreted or dropped, carriage returns and backspaces
/// overwrite, and the line terminator is removed.
pub fn plain_text(bytes: &[u8]) -> String {
    let mut row: Vec<char> = Vec::new();
    let mut col = 0usize;
    for action in VteActionParser::new().parse_bytes(bytes) {
        match action {
            Text(c) => put(&mut row, &mut col, c),
            Tab => put(&mut row, &mut col, '\t'),
            Backspace => col = col.saturating_sub(1),
            CarriageReturn => col = 0,
            LineFeed => {}
            CursorForward(n) => col += usize::from(n),
            CursorBackward(n) => col = col.saturating_sub(usize::from(n)),
            EraseInLine(0) => row.truncate(col),
            EraseInLine(1) => {
                let end = (col + 1).min(row.len());
                row[..end].fill(' ');
            }
            EraseInLine(_) => row.clear(),
        }
    }
    row.into_iter().collect()
}

fn put(row: &mut Vec<char>, col: &mut usize, c: char) {
    if *col < row.len() {
        row[*col] = c;
    } else {
        row.resize(*col, ' ');
        row.push(c);
    }
    *col += 1;
}

// Private struct to hide this implementation detail
struct Performer {
    actions: Vec<VteAction>,
}

impl Performer {
    fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }
}

// Implementation largely inspired by vt100-rust:
// https://github.com/doy/vt100-rust/blob/main/src/perform.rs
impl Perform for Performer {
    fn print(&mut self, c: char) {
        self.actions.push(Text(c))
    }

    fn execute(&mut self, byte: u8) {
        let action = match byte {
            8 => Backspace,
            9 => Tab,
            10 => LineFeed,
            13 => CarriageReturn,
            _ => return,
        };
        self.actions.push(action);
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, c: char) {
        if intermediates.is_empty() {
            let action = match c {
                'C' => CursorForward(params.canonicalize_1(1)),
                'D' => CursorBackward(params.canonicalize_1(1)),
                'K' => EraseInLine(params.first_or(0)),
                _ => return,
            };
            self.actions.push(action);
        }
    }
}

trait ParamsCanonicalize {
    fn first_or(&self, default: u16) -> u16;
    fn canonicalize_1(&self, default: u16) -> u16;
}

impl ParamsCanonicalize for Params {
    fn first_or(&self, default: u16) -> u16 {
        self.iter()
            .next()
            .and_then(|x| x.first().copied())
            .unwrap_or(default)
    }

    fn canonicalize_1(&self, default: u16) -> u16 {
        Some(self.first_or(0))
            .filter(|x| *x != 0)
            .unwrap_or(default)
    }
}
