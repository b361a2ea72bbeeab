use std::collections::VecDeque;

use vte::{Params, Parser, Perform};

const ESC: &str = "\x1b";
const CSI_START: &str = "\x1b[";
const OSC_START: &str = "\x1b]";
const DCS_START: &str = "\x1bP";
const SGR_RESET: &[u8] = b"\x1b[0m";
const TAB_STOP: usize = 8;

/// One SGR attribute as it arrived in a CSI `m` parameter group, colon
/// subparameters included (`38:5:196` stays one attribute).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgrAttribute(Vec<u16>);

impl SgrAttribute {
    /// "If no attribute is given or attribute = 0, unset all attributes."
    fn is_reset(&self) -> bool {
        self.0.is_empty() || self.0 == [0]
    }

    fn leading_code(&self) -> Option<u16> {
        self.0.first().copied()
    }

    fn to_csi(&self) -> String {
        let mut out = String::from(CSI_START);
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push_str(&part.to_string());
        }
        out.push('m');
        out
    }
}

type SgrList = Vec<SgrAttribute>;

/// Adds an attribute to a list, replacing any earlier attribute with the
/// same leading code so `ESC[1m ESC[1m` does not accumulate.
fn push_attribute(list: &mut SgrList, attr: SgrAttribute) {
    if let Some(code) = attr.leading_code() {
        list.retain(|existing| existing.leading_code() != Some(code));
    }
    list.push(attr);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Cell {
    /// `'\0'` means the cell was created by cursor movement and never
    /// written; it renders as a space if anything printed past it.
    glyph: char,
    sgr: SgrList,
    /// Escape sequences this screen does not model (colours are handled via
    /// `sgr`; everything else lands here verbatim) so they replay in place.
    extra_sequences: String,
}

#[derive(Debug, Clone, Default)]
struct Line {
    cells: Vec<Cell>,
    /// True when the child left this line with an explicit line feed (or
    /// moved the cursor below it); false means the line simply ran long and
    /// must replay unbroken.
    hard_break: bool,
}

impl Line {
    fn cell_at(&mut self, i: usize) -> &mut Cell {
        if self.cells.len() <= i {
            self.cells.resize(i + 1, Cell::default());
        }
        &mut self.cells[i]
    }

    /// Length up to the last cell that is visibly occupied: a non-blank
    /// glyph or an attached escape sequence.
    fn printed_len(&self) -> usize {
        for i in (0..self.cells.len()).rev() {
            let cell = &self.cells[i];
            if (cell.glyph != ' ' && cell.glyph != '\0') || !cell.extra_sequences.is_empty() {
                return i + 1;
            }
        }
        0
    }
}

/// In-memory model of what an interactive child has drawn, fed from the pty
/// and replayed as plain scrollback once the child reaches the foreground.
///
/// Cursor-addressed output (progress bars, `\r` overwrites) collapses to its
/// final visible form; sequences the model does not understand are carried
/// through verbatim attached to the cell they arrived at.
pub struct Screen {
    parser: Parser,
    state: ScreenState,
}

struct ScreenState {
    lines: VecDeque<Line>,
    /// Absolute index of `lines[0]`; grows as lines spill to scrollback.
    first_line_index: usize,
    max_height: usize,
    /// Cursor column. Unbounded: lines wider than the screen are kept whole
    /// so replay does not invent line breaks.
    pos_x: usize,
    /// Cursor line in absolute coordinates.
    pos_y: usize,
    current_sgr: SgrList,
    scrollback: Vec<u8>,
    ended: bool,
}

impl Screen {
    /// Only the height constrains the model; columns are tracked by the
    /// kernel pty, and lines here stay unbounded so replay never wraps.
    pub fn new(_cols: u16, rows: u16) -> Self {
        Self {
            parser: Parser::new(),
            state: ScreenState::new(usize::from(rows)),
        }
    }

    pub fn advance(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.state, bytes);
    }

    pub fn resize(&mut self, _cols: u16, rows: u16) {
        self.state.resize(usize::from(rows));
    }

    /// Flushes every remaining live line to scrollback and appends the
    /// cursor moves that put the real terminal cursor where the child's
    /// cursor was. Ending twice is a bug.
    pub fn end(&mut self) {
        self.state.end();
    }

    pub fn is_ended(&self) -> bool {
        self.state.ended
    }

    pub fn has_scrollback(&self) -> bool {
        !self.state.scrollback.is_empty()
    }

    /// Takes the queued scrollback bytes, leaving the queue empty.
    pub fn take_scrollback(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.state.scrollback)
    }
}

impl ScreenState {
    fn new(max_height: usize) -> Self {
        let mut lines = VecDeque::new();
        lines.push_back(Line::default());
        Self {
            lines,
            first_line_index: 0,
            max_height: max_height.max(1),
            pos_x: 0,
            pos_y: 0,
            current_sgr: SgrList::new(),
            scrollback: Vec::new(),
            ended: false,
        }
    }

    fn visible_y(&self) -> usize {
        self.pos_y - self.first_line_index
    }

    fn current_line(&mut self) -> &mut Line {
        let index = self.visible_y();
        &mut self.lines[index]
    }

    fn set_current_cell(&mut self, glyph: char) {
        let sgr = self.current_sgr.clone();
        let x = self.pos_x;
        let cell = self.current_line().cell_at(x);
        cell.glyph = glyph;
        cell.sgr = sgr;
    }

    fn next_line(&mut self) {
        self.current_line().hard_break = true;
        if self.visible_y() + 1 >= self.lines.len() {
            self.lines.push_back(Line::default());
        }
        self.pos_y += 1;
        if self.lines.len() > self.max_height {
            let spilled = self.lines.pop_front().expect("spill from an empty screen");
            self.first_line_index += 1;
            self.flush_line(&spilled);
        }
    }

    fn prev_line(&mut self) {
        // Lines already spilled to scrollback are unreachable.
        if self.pos_y > self.first_line_index {
            self.pos_y -= 1;
        }
    }

    fn move_vertical(&mut self, delta: i64) {
        for _ in 0..delta.max(0) {
            self.next_line();
        }
        for _ in 0..(-delta).max(0) {
            self.prev_line();
        }
    }

    fn move_horizontal(&mut self, delta: i64) {
        if delta >= 0 {
            self.pos_x += delta as usize;
        } else {
            self.pos_x = self.pos_x.saturating_sub((-delta) as usize);
        }
    }

    fn move_to_column(&mut self, x: i64) {
        self.pos_x = x.max(0) as usize;
    }

    fn move_to_row(&mut self, y: i64) {
        let delta = y.max(0) - self.visible_y() as i64;
        self.move_vertical(delta);
    }

    fn delete_left(&mut self, how_many: usize) {
        for _ in 0..how_many {
            self.move_horizontal(-1);
            self.set_current_cell(' ');
            if self.pos_x == 0 {
                break;
            }
        }
    }

    fn tab(&mut self) {
        let stop = (self.pos_x / TAB_STOP + 1) * TAB_STOP;
        while self.pos_x < stop {
            self.set_current_cell(' ');
            self.pos_x += 1;
        }
    }

    fn attach_unhandled(&mut self, sequence: &str) {
        // Keep the sequence where it arrived, but do not move the cursor.
        let x = self.pos_x;
        self.current_line()
            .cell_at(x)
            .extra_sequences
            .push_str(sequence);
    }

    fn apply_sgr(&mut self, params: &Params) {
        if params.len() == 0 {
            self.current_sgr.clear();
            return;
        }
        for group in params.iter() {
            let attr = SgrAttribute(group.to_vec());
            if attr.is_reset() {
                self.current_sgr.clear();
            } else {
                push_attribute(&mut self.current_sgr, attr);
            }
        }
    }

    /// Emits one line's cells to scrollback: attached escape sequences in
    /// place, SGR runs bracketed by resets so state never leaks across
    /// cells, a trailing newline only where the child put one.
    fn flush_line(&mut self, line: &Line) {
        let printed = line.printed_len();
        let mut previous_sgr: &[SgrAttribute] = &[];
        let mut did_set_sgr = false;
        for cell in &line.cells[..printed] {
            if !cell.extra_sequences.is_empty() {
                self.scrollback.extend_from_slice(cell.extra_sequences.as_bytes());
            }
            if cell.sgr != previous_sgr {
                self.scrollback.extend_from_slice(SGR_RESET);
                for attr in &cell.sgr {
                    self.scrollback.extend_from_slice(attr.to_csi().as_bytes());
                }
                did_set_sgr = true;
                previous_sgr = &cell.sgr;
            }
            let glyph = if cell.glyph == '\0' { ' ' } else { cell.glyph };
            let mut buf = [0u8; 4];
            self.scrollback
                .extend_from_slice(glyph.encode_utf8(&mut buf).as_bytes());
        }
        if did_set_sgr {
            self.scrollback.extend_from_slice(SGR_RESET);
        }
        if line.hard_break {
            self.scrollback.push(b'\n');
        }
    }

    fn end(&mut self) {
        assert!(!self.ended, "screen end() called twice");
        self.ended = true;

        let target_row = self.visible_y() as i64;
        let target_col = self.pos_x as i64;

        let lines: Vec<Line> = self.lines.drain(..).collect();
        let mut cursor_row = 0i64;
        let mut cursor_col = 0i64;
        for line in &lines {
            self.flush_line(line);
            if line.hard_break {
                cursor_row += 1;
                cursor_col = 0;
            } else {
                cursor_col = line.printed_len() as i64;
            }
        }

        // Walk the terminal cursor back from the end of the flushed region
        // to where the child's cursor actually was, so output produced after
        // promotion lands where a natively-running child would have put it.
        let dx = target_col - cursor_col;
        if dx > 0 {
            self.scrollback
                .extend_from_slice(format!("{CSI_START}{dx}C").as_bytes());
        } else if dx < 0 {
            self.scrollback
                .extend_from_slice(format!("{CSI_START}{}D", -dx).as_bytes());
        }
        let dy = target_row - cursor_row;
        if dy > 0 {
            self.scrollback
                .extend_from_slice(format!("{CSI_START}{dy}B").as_bytes());
        } else if dy < 0 {
            self.scrollback
                .extend_from_slice(format!("{CSI_START}{}A", -dy).as_bytes());
        }
    }

    fn resize(&mut self, max_height: usize) {
        self.max_height = max_height.max(1);
        while self.lines.len() > self.max_height {
            let spilled = self.lines.pop_front().expect("spill from an empty screen");
            self.first_line_index += 1;
            self.flush_line(&spilled);
        }
        if self.pos_y < self.first_line_index {
            self.pos_y = self.first_line_index;
        }
    }
}

fn cursor_param(params: &Params, index: usize) -> i64 {
    // A missing or zero parameter means 1 for cursor motion.
    let value = params
        .iter()
        .nth(index)
        .and_then(|group| group.first())
        .copied()
        .unwrap_or(0);
    if value == 0 { 1 } else { i64::from(value) }
}

fn params_to_string(params: &Params) -> String {
    let mut out = String::new();
    for (i, group) in params.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        for (j, part) in group.iter().enumerate() {
            if j > 0 {
                out.push(':');
            }
            out.push_str(&part.to_string());
        }
    }
    out
}

/// CSI bytes 0x30..=0x3f ahead of the parameters are private-use markers;
/// they come through `intermediates` and must be re-emitted ahead of the
/// parameter string when a sequence is carried verbatim.
fn split_intermediates(intermediates: &[u8]) -> (String, String) {
    let mut private_markers = String::new();
    let mut real = String::new();
    for &b in intermediates {
        if (0x30..=0x3f).contains(&b) {
            private_markers.push(b as char);
        } else {
            real.push(b as char);
        }
    }
    (private_markers, real)
}

impl Perform for ScreenState {
    fn print(&mut self, c: char) {
        self.set_current_cell(c);
        self.pos_x += 1;
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.move_to_column(0);
                self.move_vertical(1);
            }
            b'\r' => self.move_to_column(0),
            0x08 => self.delete_left(1),
            b'\t' => self.tab(),
            _ => tracing::trace!("unhandled control byte {byte:#04x}"),
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        if intermediates.is_empty() {
            match action {
                'A' => return self.move_vertical(-cursor_param(params, 0)),
                'B' => return self.move_vertical(cursor_param(params, 0)),
                'C' => return self.move_horizontal(cursor_param(params, 0)),
                'D' => return self.move_horizontal(-cursor_param(params, 0)),
                'H' => {
                    // 1-based row;column.
                    self.move_to_row(cursor_param(params, 0) - 1);
                    self.move_to_column(cursor_param(params, 1) - 1);
                    return;
                }
                'G' | '`' => return self.move_to_column(cursor_param(params, 0) - 1),
                'd' => return self.move_to_row(cursor_param(params, 0) - 1),
                'm' => return self.apply_sgr(params),
                _ => {}
            }
        }

        tracing::trace!(
            "carrying unhandled CSI sequence: params={} final={action}",
            params_to_string(params)
        );
        let (private_markers, real) = split_intermediates(intermediates);
        self.attach_unhandled(&format!(
            "{CSI_START}{private_markers}{}{real}{action}",
            params_to_string(params)
        ));
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        let intermediates: String = intermediates.iter().map(|&b| b as char).collect();
        self.attach_unhandled(&format!("{ESC}{intermediates}{}", byte as char));
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], bell_terminated: bool) {
        let mut sequence = String::from(OSC_START);
        for (i, param) in params.iter().enumerate() {
            if i > 0 {
                sequence.push(';');
            }
            sequence.push_str(&String::from_utf8_lossy(param));
        }
        // The parser swallows the terminator; restore it or the replayed
        // terminal would eat everything that follows.
        sequence.push_str(if bell_terminated { "\x07" } else { "\x1b\\" });
        self.attach_unhandled(&sequence);
    }

    fn hook(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let (private_markers, real) = split_intermediates(intermediates);
        self.attach_unhandled(&format!(
            "{DCS_START}{private_markers}{}{real}{action}",
            params_to_string(params)
        ));
    }

    fn put(&mut self, byte: u8) {
        self.attach_unhandled(&(byte as char).to_string());
    }

    fn unhook(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(input: &[u8], cols: u16, rows: u16) -> Vec<u8> {
        let mut screen = Screen::new(cols, rows);
        screen.advance(input);
        screen.end();
        screen.take_scrollback()
    }

    #[test]
    fn plain_text_is_the_identity() {
        assert_eq!(replay(b"hello\nworld\n", 80, 24), b"hello\nworld\n");
    }

    #[test]
    fn carriage_return_overwrite_keeps_the_last_write() {
        assert_eq!(replay(b"A\rB", 80, 24), b"B");
    }

    #[test]
    fn backspace_erases_to_the_left() {
        assert_eq!(replay(b"ab\x08", 80, 24), b"a");
    }

    #[test]
    fn cursor_position_overwrites_in_place() {
        assert_eq!(replay(b"ab\x1b[1;1HZ", 80, 24), b"Zb\x1b[1D");
    }

    #[test]
    fn horizontal_absolute_moves_the_column() {
        // HPA to column 2, overwrite the 'b'.
        assert_eq!(replay(b"abc\x1b[2GX", 80, 24), b"aXc\x1b[1D");
    }

    #[test]
    fn overflow_spills_oldest_line_to_scrollback() {
        let mut screen = Screen::new(80, 2);
        screen.advance(b"one\ntwo\nthree");
        assert_eq!(screen.take_scrollback(), b"one\n");
        screen.end();
        assert_eq!(screen.take_scrollback(), b"two\nthree");
    }

    #[test]
    fn sgr_runs_are_bracketed_with_resets() {
        assert_eq!(
            replay(b"\x1b[31mred\x1b[0mok", 80, 24),
            b"\x1b[0m\x1b[31mred\x1b[0mok\x1b[0m".as_slice()
        );
    }

    #[test]
    fn repeated_sgr_codes_do_not_accumulate() {
        let mut screen = Screen::new(80, 24);
        screen.advance(b"\x1b[1m\x1b[1m\x1b[31mx");
        screen.end();
        let out = String::from_utf8(screen.take_scrollback()).expect("utf8");
        assert_eq!(out.matches("\x1b[1m").count(), 1);
    }

    #[test]
    fn unknown_sequences_are_carried_verbatim() {
        assert_eq!(replay(b"a\x1b[?25lb", 80, 24), b"a\x1b[?25lb");
    }

    #[test]
    fn osc_sequences_keep_their_terminator() {
        let out = replay(b"\x1b]0;title\x07x", 80, 24);
        assert_eq!(out, b"\x1b]0;title\x07x");
    }

    #[test]
    fn cursor_restore_walks_back_to_the_child_cursor() {
        // Cursor ends on the first line, one column past the 'x'.
        assert_eq!(replay(b"one\ntwo\x1b[Ax", 80, 24), b"onex\ntwo\x1b[1C\x1b[1A");
    }

    #[test]
    fn long_lines_replay_without_invented_breaks() {
        let long = vec![b'z'; 200];
        let mut input = long.clone();
        input.push(b'\n');
        let mut expected = long;
        expected.push(b'\n');
        assert_eq!(replay(&input, 80, 24), expected);
    }

    #[test]
    fn tab_advances_to_the_next_stop() {
        assert_eq!(replay(b"a\tb", 80, 24), b"a       b");
    }

    #[test]
    fn chunked_replay_matches_single_pass() {
        let input = b"alpha\x1b[31m beta\r\n\x1b[2;3HZZ\x1b[0m done".as_slice();
        let mut one_pass = Screen::new(20, 4);
        one_pass.advance(input);
        one_pass.end();

        let mut chunked = Screen::new(20, 4);
        for chunk in input.chunks(3) {
            chunked.advance(chunk);
        }
        chunked.end();

        assert_eq!(one_pass.take_scrollback(), chunked.take_scrollback());
    }

    #[test]
    #[should_panic(expected = "end() called twice")]
    fn ending_twice_is_a_bug() {
        let mut screen = Screen::new(80, 24);
        screen.end();
        screen.end();
    }
}
