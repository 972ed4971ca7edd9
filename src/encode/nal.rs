//! Annex-B NAL unit scanning.

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// One NAL unit: header type plus payload without the start code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    pub kind: u8,
    pub data: &'a [u8],
}

/// Iterator over the NAL units of an Annex-B byte stream.
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Find the next `00 00 01` starting at `from`; returns (code start, payload start).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let start = if i > from && data[i - 1] == 0 { i - 1 } else { i };
            return Some((start, i + 3));
        }
        i += 1;
    }
    None
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = NalUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, begin) = find_start_code(self.data, self.pos)?;
        let end = match find_start_code(self.data, begin) {
            Some((code, _)) => code,
            None => self.data.len(),
        };
        self.pos = end;
        let data = &self.data[begin..end];
        let header = *data.first()?;
        Some(NalUnit {
            kind: header & 0x1f,
            data,
        })
    }
}

pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    NalUnits { data, pos: 0 }
}

/// True when the access unit can start decoding: it carries an IDR slice.
pub fn contains_keyframe(data: &[u8]) -> bool {
    nal_units(data).any(|nal| nal.kind == NAL_IDR)
}

/// Number of coded picture slices (IDR or non-IDR) in the stream.
pub fn count_pictures(data: &[u8]) -> usize {
    nal_units(data)
        .filter(|nal| nal.kind == NAL_IDR || nal.kind == NAL_SLICE)
        .count()
}
