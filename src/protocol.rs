//! Wire protocol between clients and the server.
//!
//! Every frame is an 8-byte little-endian length followed by the payload:
//!
//! ```text
//! flag:   u32                       (offset 0)
//! tag:    u32  Win or RawInput      (offset 4)
//! length: u32  bytes after this     (offset 8)
//! payload {
//!     TLV { tag: Map, len, offsets[COMMAND_COUNT]: u32 }   (always first)
//!     TLV { tag, len, bytes }  per present command kind
//! }
//! ```
//!
//! Map entries are byte offsets of each kind's TLV relative to the payload
//! area, zero when the kind is absent. Server-to-client result commands are
//! pre-built once per client as templates and patched per send.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use thiserror::Error;

/// Commit accepted.
pub const COMMIT_OK: u64 = 0;
/// Commit superseded an earlier uncommitted buffer for the same surface;
/// the replaced buffer has been released to the client already.
pub const COMMIT_REPLACE: u64 = 2;
/// Generic failure sentinel (-1 on the wire).
pub const RESULT_FAILURE: u64 = u64::MAX;

pub const MAX_DESKTOP_NR: usize = 8;
pub const SHM_NAME_LEN: usize = 32;

/// Command kinds, one bit position each; indexes the frame offset map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmdKind {
    LinkupAck = 0,
    CreateSurface,
    CreateSurfaceAck,
    CreateView,
    CreateViewAck,
    CreateBo,
    CreateBoAck,
    DestroyBo,
    DestroyBoAck,
    Commit,
    CommitAck,
    BoFlipped,
    BoComplete,
    RawInputEvt,
    Destroy,
    DestroyAck,
    Shell,
    Hpd,
}

pub const COMMAND_COUNT: usize = 18;

const ALL_KINDS: [CmdKind; COMMAND_COUNT] = [
    CmdKind::LinkupAck,
    CmdKind::CreateSurface,
    CmdKind::CreateSurfaceAck,
    CmdKind::CreateView,
    CmdKind::CreateViewAck,
    CmdKind::CreateBo,
    CmdKind::CreateBoAck,
    CmdKind::DestroyBo,
    CmdKind::DestroyBoAck,
    CmdKind::Commit,
    CmdKind::CommitAck,
    CmdKind::BoFlipped,
    CmdKind::BoComplete,
    CmdKind::RawInputEvt,
    CmdKind::Destroy,
    CmdKind::DestroyAck,
    CmdKind::Shell,
    CmdKind::Hpd,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Tag {
    RawInput = 0,
    Win,
    Map,
    Result,
    CreateSurface,
    CreateView,
    CreateBo,
    CommitInfo,
    Shell,
    Destroy,
}

impl CmdKind {
    fn tag(self) -> Tag {
        match self {
            CmdKind::CreateSurface => Tag::CreateSurface,
            CmdKind::CreateView => Tag::CreateView,
            CmdKind::CreateBo => Tag::CreateBo,
            CmdKind::Commit => Tag::CommitInfo,
            CmdKind::Shell => Tag::Shell,
            CmdKind::RawInputEvt => Tag::RawInput,
            CmdKind::Destroy | CmdKind::DestroyBo => Tag::Destroy,
            _ => Tag::Result,
        }
    }

    fn outer_tag(self) -> Tag {
        match self {
            CmdKind::RawInputEvt => Tag::RawInput,
            _ => Tag::Win,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame truncated")]
    Truncated,

    #[error("declared payload length {declared} does not match received {received}")]
    LengthMismatch { declared: u32, received: u32 },

    #[error("unexpected outer tag {0}")]
    BadOuterTag(u32),

    #[error("frame does not begin with an offset map")]
    BadMap,

    #[error("command {kind:?} carries tag {found}")]
    BadTag { kind: CmdKind, found: u32 },

    #[error("unknown pixel format {0}")]
    UnknownFormat(u32),

    #[error("unknown buffer type {0}")]
    UnknownBufferType(u32),

    #[error("unknown shell command {0}")]
    UnknownShellCmd(u32),

    #[error("shared memory name is not valid")]
    BadShmName,
}

/// Desktop- and buffer-space rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Rect {
        Rect { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.w as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h as i32
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.write_i32::<LittleEndian>(self.x).unwrap();
        out.write_i32::<LittleEndian>(self.y).unwrap();
        out.write_u32::<LittleEndian>(self.w).unwrap();
        out.write_u32::<LittleEndian>(self.h).unwrap();
    }

    fn decode(rd: &mut Reader) -> Result<Rect, ProtocolError> {
        Ok(Rect {
            x: rd.i32()?,
            y: rd.i32()?,
            w: rd.u32()?,
            h: rd.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
    Argb8888 = 1,
    Xrgb8888,
    Rgb888,
    Rgb565,
    Nv12,
    Nv16,
    Nv24,
    Yuyv,
    Yuv420,
    Yuv422,
    Yuv444,
}

impl PixelFormat {
    pub fn from_wire(v: u32) -> Result<PixelFormat, ProtocolError> {
        Ok(match v {
            1 => PixelFormat::Argb8888,
            2 => PixelFormat::Xrgb8888,
            3 => PixelFormat::Rgb888,
            4 => PixelFormat::Rgb565,
            5 => PixelFormat::Nv12,
            6 => PixelFormat::Nv16,
            7 => PixelFormat::Nv24,
            8 => PixelFormat::Yuyv,
            9 => PixelFormat::Yuv420,
            10 => PixelFormat::Yuv422,
            11 => PixelFormat::Yuv444,
            other => return Err(ProtocolError::UnknownFormat(other)),
        })
    }

    /// Number of memory planes this format occupies.
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Argb8888
            | PixelFormat::Xrgb8888
            | PixelFormat::Rgb888
            | PixelFormat::Rgb565
            | PixelFormat::Yuyv => 1,
            PixelFormat::Nv12 | PixelFormat::Nv16 | PixelFormat::Nv24 => 2,
            PixelFormat::Yuv420 | PixelFormat::Yuv422 | PixelFormat::Yuv444 => 3,
        }
    }

    /// Bytes per pixel of plane 0.
    pub fn bpp(self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgb565 | PixelFormat::Yuyv => 2,
            _ => 1,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Argb8888)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufferType {
    Shm = 1,
    Dma = 2,
}

impl BufferType {
    pub fn from_wire(v: u32) -> Result<BufferType, ProtocolError> {
        Ok(match v {
            1 => BufferType::Shm,
            2 => BufferType::Dma,
            other => return Err(ProtocolError::UnknownBufferType(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SurfaceInfo {
    pub surface_id: u64,
    pub is_opaque: bool,
    pub damage: Rect,
    pub width: u32,
    pub height: u32,
    pub opaque: Rect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewInfo {
    pub view_id: u64,
    pub full_screen: bool,
    /// Float view: stacks above every composed view, composable only with
    /// the topmost of its band.
    pub top_level: bool,
    pub area: Rect,
    pub alpha: f32,
    pub output_mask: u32,
    pub primary_output: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferInfo {
    pub format: PixelFormat,
    pub kind: BufferType,
    /// SHM pool name; at most `SHM_NAME_LEN - 1` bytes on the wire.
    pub shm_name: String,
    pub width: u32,
    pub height: u32,
    pub strides: [u32; 4],
    pub offsets: [u32; 4],
    pub sizes: [u64; 4],
    pub planes: i32,
    pub surface_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CommitInfo {
    pub bo_id: u64,
    pub bo_damage: Rect,
    pub shown: bool,
    pub view_x: i32,
    pub view_y: i32,
    pub view_hot_x: i32,
    pub view_hot_y: i32,
    pub view_width: u32,
    pub view_height: u32,
    /// -1 falling, 0 unchanged, +1 bring to top.
    pub delta_z: i32,
}

/// Per-component log gates, settable at runtime through the shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugFlags {
    pub common: u8,
    pub compositor: u8,
    pub scanout: u8,
    pub renderer: u8,
    pub event: u8,
    pub protocol: u8,
    pub client: u8,
    pub server: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LayoutMode {
    Duplicated = 0,
    Extended = 1,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanvasLayout {
    pub mode: LayoutMode,
    pub rects: Vec<Rect>,
}

impl CanvasLayout {
    /// Bounding rectangle of the canvas: the union in extended mode, the
    /// first rectangle in duplicated mode.
    pub fn canvas(&self) -> Rect {
        match self.mode {
            LayoutMode::Duplicated => self.rects.first().copied().unwrap_or_default(),
            LayoutMode::Extended => {
                let mut x0 = i32::MAX;
                let mut y0 = i32::MAX;
                let mut x1 = i32::MIN;
                let mut y1 = i32::MIN;
                for r in &self.rects {
                    x0 = x0.min(r.x);
                    y0 = y0.min(r.y);
                    x1 = x1.max(r.right());
                    y1 = y1.max(r.bottom());
                }
                if self.rects.is_empty() {
                    Rect::default()
                } else {
                    Rect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShellInfo {
    DebugSetting(DebugFlags),
    CanvasLayoutSetting(CanvasLayout),
    CanvasLayoutQuery,
    /// Client announces its capability bits and raw-input enable state.
    Capability { cap: u64, raw_input_en: bool },
}

/// One raw HID event record; the 8-byte value field is a union on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInputEvent {
    pub kind: u16,
    pub code: u16,
    raw: [u8; 8],
}

impl RawInputEvent {
    pub fn with_value(kind: u16, code: u16, value: u32) -> RawInputEvent {
        let mut raw = [0u8; 8];
        LittleEndian::write_u32(&mut raw[..4], value);
        RawInputEvent { kind, code, raw }
    }

    pub fn with_pos(kind: u16, code: u16, x: u16, y: u16, dx: i16, dy: i16) -> RawInputEvent {
        let mut raw = [0u8; 8];
        LittleEndian::write_u16(&mut raw[0..2], x);
        LittleEndian::write_u16(&mut raw[2..4], y);
        LittleEndian::write_i16(&mut raw[4..6], dx);
        LittleEndian::write_i16(&mut raw[6..8], dy);
        RawInputEvent { kind, code, raw }
    }

    pub fn value(&self) -> u32 {
        LittleEndian::read_u32(&self.raw[..4])
    }

    pub fn pos(&self) -> (u16, u16, i16, i16) {
        (
            LittleEndian::read_u16(&self.raw[0..2]),
            LittleEndian::read_u16(&self.raw[2..4]),
            LittleEndian::read_i16(&self.raw[4..6]),
            LittleEndian::read_i16(&self.raw[6..8]),
        )
    }
}

/// Hotplug notification payload: bit i = head i present in the
/// configuration, bit i+8 = head i connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HpdInfo(pub u64);

impl HpdInfo {
    pub fn set(&mut self, index: usize, on: bool) {
        self.0 |= 1 << index;
        if on {
            self.0 |= 1 << (index + 8);
        } else {
            self.0 &= !(1 << (index + 8));
        }
    }

    pub fn available(&self, index: usize) -> bool {
        self.0 & (1 << index) != 0
    }

    pub fn on(&self, index: usize) -> bool {
        self.available(index) && self.0 & (1 << (index + 8)) != 0
    }
}

/// A decoded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    LinkupAck(u64),
    CreateSurface(SurfaceInfo),
    CreateSurfaceAck(u64),
    CreateView(ViewInfo),
    CreateViewAck(u64),
    CreateBo(BufferInfo),
    CreateBoAck(u64),
    DestroyBo(u64),
    DestroyBoAck(u64),
    Commit(CommitInfo),
    CommitAck(u64),
    BoFlipped(u64),
    BoComplete(u64),
    RawInput(Vec<RawInputEvent>),
    Destroy(u64),
    DestroyAck(u64),
    Shell(ShellInfo),
    Hpd(u64),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }
}

const HEAD_LEN: usize = 12;
const MAP_TLV_LEN: usize = 8 + COMMAND_COUNT * 4;
const PREFIX_LEN: usize = 8;

/// Builds one frame, length prefix included.
pub struct FrameBuilder {
    buf: Vec<u8>,
    map: [u32; COMMAND_COUNT],
}

impl FrameBuilder {
    pub fn new(first_kind: CmdKind) -> FrameBuilder {
        let mut buf = Vec::with_capacity(PREFIX_LEN + HEAD_LEN + MAP_TLV_LEN + 64);
        buf.resize(PREFIX_LEN, 0);
        buf.write_u32::<LittleEndian>(0).unwrap(); // flag
        buf.write_u32::<LittleEndian>(first_kind.outer_tag() as u32)
            .unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap(); // total length, patched
        buf.write_u32::<LittleEndian>(Tag::Map as u32).unwrap();
        buf.write_u32::<LittleEndian>((COMMAND_COUNT * 4) as u32)
            .unwrap();
        buf.resize(PREFIX_LEN + HEAD_LEN + MAP_TLV_LEN, 0);
        FrameBuilder {
            buf,
            map: [0; COMMAND_COUNT],
        }
    }

    /// Append one command TLV; returns the offset of its payload within the
    /// finished frame (used for template patching).
    pub fn tlv(&mut self, kind: CmdKind, payload: &[u8]) -> usize {
        let payload_area_off = (self.buf.len() - PREFIX_LEN - HEAD_LEN) as u32;
        self.map[kind as usize] = payload_area_off;
        self.buf
            .write_u32::<LittleEndian>(kind.tag() as u32)
            .unwrap();
        self.buf
            .write_u32::<LittleEndian>(payload.len() as u32)
            .unwrap();
        let value_off = self.buf.len();
        self.buf.extend_from_slice(payload);
        value_off
    }

    pub fn finish(mut self) -> Vec<u8> {
        let total = (self.buf.len() - PREFIX_LEN - HEAD_LEN) as u32;
        LittleEndian::write_u32(&mut self.buf[PREFIX_LEN + 8..PREFIX_LEN + 12], total);
        let map_start = PREFIX_LEN + HEAD_LEN + 8;
        for (i, off) in self.map.iter().enumerate() {
            LittleEndian::write_u32(
                &mut self.buf[map_start + i * 4..map_start + i * 4 + 4],
                *off,
            );
        }
        let frame_len = (self.buf.len() - PREFIX_LEN) as u64;
        LittleEndian::write_u64(&mut self.buf[..PREFIX_LEN], frame_len);
        self.buf
    }
}

fn encode_surface_info(s: &SurfaceInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(52);
    out.write_u64::<LittleEndian>(s.surface_id).unwrap();
    out.write_u32::<LittleEndian>(s.is_opaque as u32).unwrap();
    s.damage.encode(&mut out);
    out.write_u32::<LittleEndian>(s.width).unwrap();
    out.write_u32::<LittleEndian>(s.height).unwrap();
    s.opaque.encode(&mut out);
    out
}

fn decode_surface_info(rd: &mut Reader) -> Result<SurfaceInfo, ProtocolError> {
    Ok(SurfaceInfo {
        surface_id: rd.u64()?,
        is_opaque: rd.u32()? != 0,
        damage: Rect::decode(rd)?,
        width: rd.u32()?,
        height: rd.u32()?,
        opaque: Rect::decode(rd)?,
    })
}

fn encode_view_info(v: &ViewInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(44);
    out.write_u64::<LittleEndian>(v.view_id).unwrap();
    out.write_u32::<LittleEndian>(v.full_screen as u32).unwrap();
    out.write_u32::<LittleEndian>(v.top_level as u32).unwrap();
    v.area.encode(&mut out);
    out.write_f32::<LittleEndian>(v.alpha).unwrap();
    out.write_u32::<LittleEndian>(v.output_mask).unwrap();
    out.write_u32::<LittleEndian>(v.primary_output).unwrap();
    out
}

fn decode_view_info(rd: &mut Reader) -> Result<ViewInfo, ProtocolError> {
    Ok(ViewInfo {
        view_id: rd.u64()?,
        full_screen: rd.u32()? != 0,
        top_level: rd.u32()? != 0,
        area: Rect::decode(rd)?,
        alpha: rd.f32()?,
        output_mask: rd.u32()?,
        primary_output: rd.u32()?,
    })
}

fn encode_buffer_info(b: &BufferInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(124);
    out.write_u32::<LittleEndian>(b.format as u32).unwrap();
    out.write_u32::<LittleEndian>(b.kind as u32).unwrap();
    let mut name = [0u8; SHM_NAME_LEN];
    let bytes = b.shm_name.as_bytes();
    name[..bytes.len().min(SHM_NAME_LEN - 1)]
        .copy_from_slice(&bytes[..bytes.len().min(SHM_NAME_LEN - 1)]);
    out.extend_from_slice(&name);
    out.write_u32::<LittleEndian>(b.width).unwrap();
    out.write_u32::<LittleEndian>(b.height).unwrap();
    for s in b.strides {
        out.write_u32::<LittleEndian>(s).unwrap();
    }
    for o in b.offsets {
        out.write_u32::<LittleEndian>(o).unwrap();
    }
    for s in b.sizes {
        out.write_u64::<LittleEndian>(s).unwrap();
    }
    out.write_i32::<LittleEndian>(b.planes).unwrap();
    out.write_u64::<LittleEndian>(b.surface_id).unwrap();
    out
}

fn decode_buffer_info(rd: &mut Reader) -> Result<BufferInfo, ProtocolError> {
    let format = PixelFormat::from_wire(rd.u32()?)?;
    let kind = BufferType::from_wire(rd.u32()?)?;
    let raw_name = rd.take(SHM_NAME_LEN)?;
    let end = raw_name.iter().position(|&b| b == 0).unwrap_or(SHM_NAME_LEN);
    let shm_name = std::str::from_utf8(&raw_name[..end])
        .map_err(|_| ProtocolError::BadShmName)?
        .to_string();
    let width = rd.u32()?;
    let height = rd.u32()?;
    let mut strides = [0u32; 4];
    for s in strides.iter_mut() {
        *s = rd.u32()?;
    }
    let mut offsets = [0u32; 4];
    for o in offsets.iter_mut() {
        *o = rd.u32()?;
    }
    let mut sizes = [0u64; 4];
    for s in sizes.iter_mut() {
        *s = rd.u64()?;
    }
    Ok(BufferInfo {
        format,
        kind,
        shm_name,
        width,
        height,
        strides,
        offsets,
        sizes,
        planes: rd.i32()?,
        surface_id: rd.u64()?,
    })
}

fn encode_commit_info(c: &CommitInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(56);
    out.write_u64::<LittleEndian>(c.bo_id).unwrap();
    c.bo_damage.encode(&mut out);
    out.write_i32::<LittleEndian>(c.shown as i32).unwrap();
    out.write_i32::<LittleEndian>(c.view_x).unwrap();
    out.write_i32::<LittleEndian>(c.view_y).unwrap();
    out.write_i32::<LittleEndian>(c.view_hot_x).unwrap();
    out.write_i32::<LittleEndian>(c.view_hot_y).unwrap();
    out.write_u32::<LittleEndian>(c.view_width).unwrap();
    out.write_u32::<LittleEndian>(c.view_height).unwrap();
    out.write_i32::<LittleEndian>(c.delta_z).unwrap();
    out
}

fn decode_commit_info(rd: &mut Reader) -> Result<CommitInfo, ProtocolError> {
    Ok(CommitInfo {
        bo_id: rd.u64()?,
        bo_damage: Rect::decode(rd)?,
        shown: rd.i32()? != 0,
        view_x: rd.i32()?,
        view_y: rd.i32()?,
        view_hot_x: rd.i32()?,
        view_hot_y: rd.i32()?,
        view_width: rd.u32()?,
        view_height: rd.u32()?,
        delta_z: rd.i32()?,
    })
}

fn encode_shell_info(s: &ShellInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(140);
    match s {
        ShellInfo::DebugSetting(f) => {
            out.write_u32::<LittleEndian>(0).unwrap();
            out.extend_from_slice(&[
                f.common, f.compositor, f.scanout, f.renderer, f.event, f.protocol, f.client,
                f.server,
            ]);
        }
        ShellInfo::CanvasLayoutSetting(layout) => {
            out.write_u32::<LittleEndian>(1).unwrap();
            out.write_u32::<LittleEndian>(layout.rects.len() as u32)
                .unwrap();
            out.write_u32::<LittleEndian>(layout.mode as u32).unwrap();
            for i in 0..MAX_DESKTOP_NR {
                layout.rects.get(i).copied().unwrap_or_default().encode(&mut out);
            }
        }
        ShellInfo::CanvasLayoutQuery => {
            out.write_u32::<LittleEndian>(2).unwrap();
        }
        ShellInfo::Capability { cap, raw_input_en } => {
            out.write_u32::<LittleEndian>(3).unwrap();
            out.write_u64::<LittleEndian>(*cap).unwrap();
            out.write_u32::<LittleEndian>(*raw_input_en as u32).unwrap();
        }
    }
    out
}

fn decode_shell_info(rd: &mut Reader) -> Result<ShellInfo, ProtocolError> {
    Ok(match rd.u32()? {
        0 => {
            let f = rd.take(8)?;
            ShellInfo::DebugSetting(DebugFlags {
                common: f[0],
                compositor: f[1],
                scanout: f[2],
                renderer: f[3],
                event: f[4],
                protocol: f[5],
                client: f[6],
                server: f[7],
            })
        }
        1 => {
            let count = rd.u32()? as usize;
            if count > MAX_DESKTOP_NR {
                return Err(ProtocolError::Truncated);
            }
            let mode = match rd.u32()? {
                0 => LayoutMode::Duplicated,
                _ => LayoutMode::Extended,
            };
            let mut rects = Vec::with_capacity(count);
            for i in 0..MAX_DESKTOP_NR {
                let r = Rect::decode(rd)?;
                if i < count {
                    rects.push(r);
                }
            }
            ShellInfo::CanvasLayoutSetting(CanvasLayout { mode, rects })
        }
        2 => ShellInfo::CanvasLayoutQuery,
        3 => ShellInfo::Capability {
            cap: rd.u64()?,
            raw_input_en: rd.u32()? != 0,
        },
        other => return Err(ProtocolError::UnknownShellCmd(other)),
    })
}

fn encode_raw_input_events(evts: &[RawInputEvent]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + evts.len() * 12);
    out.write_u32::<LittleEndian>(evts.len() as u32).unwrap();
    for e in evts {
        out.write_u16::<LittleEndian>(e.kind).unwrap();
        out.write_u16::<LittleEndian>(e.code).unwrap();
        out.extend_from_slice(&e.raw);
    }
    out
}

fn decode_raw_input_events(rd: &mut Reader) -> Result<Vec<RawInputEvent>, ProtocolError> {
    let count = rd.u32()? as usize;
    let mut evts = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let kind = rd.u16()?;
        let code = rd.u16()?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(rd.take(8)?);
        evts.push(RawInputEvent { kind, code, raw });
    }
    Ok(evts)
}

fn result_kind_value(kind: CmdKind, msg: &Message) -> Option<u64> {
    Some(match (kind, msg) {
        (CmdKind::LinkupAck, Message::LinkupAck(v)) => *v,
        (CmdKind::CreateSurfaceAck, Message::CreateSurfaceAck(v)) => *v,
        (CmdKind::CreateViewAck, Message::CreateViewAck(v)) => *v,
        (CmdKind::CreateBoAck, Message::CreateBoAck(v)) => *v,
        (CmdKind::DestroyBo, Message::DestroyBo(v)) => *v,
        (CmdKind::DestroyBoAck, Message::DestroyBoAck(v)) => *v,
        (CmdKind::CommitAck, Message::CommitAck(v)) => *v,
        (CmdKind::BoFlipped, Message::BoFlipped(v)) => *v,
        (CmdKind::BoComplete, Message::BoComplete(v)) => *v,
        (CmdKind::Destroy, Message::Destroy(v)) => *v,
        (CmdKind::DestroyAck, Message::DestroyAck(v)) => *v,
        (CmdKind::Hpd, Message::Hpd(v)) => *v,
        _ => return None,
    })
}

/// Encode one message as a complete frame, length prefix included.
pub fn encode(msg: &Message) -> Vec<u8> {
    let (kind, payload) = match msg {
        Message::LinkupAck(_) => (CmdKind::LinkupAck, None),
        Message::CreateSurface(s) => (CmdKind::CreateSurface, Some(encode_surface_info(s))),
        Message::CreateSurfaceAck(_) => (CmdKind::CreateSurfaceAck, None),
        Message::CreateView(v) => (CmdKind::CreateView, Some(encode_view_info(v))),
        Message::CreateViewAck(_) => (CmdKind::CreateViewAck, None),
        Message::CreateBo(b) => (CmdKind::CreateBo, Some(encode_buffer_info(b))),
        Message::CreateBoAck(_) => (CmdKind::CreateBoAck, None),
        Message::DestroyBo(_) => (CmdKind::DestroyBo, None),
        Message::DestroyBoAck(_) => (CmdKind::DestroyBoAck, None),
        Message::Commit(c) => (CmdKind::Commit, Some(encode_commit_info(c))),
        Message::CommitAck(_) => (CmdKind::CommitAck, None),
        Message::BoFlipped(_) => (CmdKind::BoFlipped, None),
        Message::BoComplete(_) => (CmdKind::BoComplete, None),
        Message::RawInput(evts) => (CmdKind::RawInputEvt, Some(encode_raw_input_events(evts))),
        Message::Destroy(_) => (CmdKind::Destroy, None),
        Message::DestroyAck(_) => (CmdKind::DestroyAck, None),
        Message::Shell(s) => (CmdKind::Shell, Some(encode_shell_info(s))),
        Message::Hpd(_) => (CmdKind::Hpd, None),
    };

    let mut fb = FrameBuilder::new(kind);
    match payload {
        Some(bytes) => {
            fb.tlv(kind, &bytes);
        }
        None => {
            let value = result_kind_value(kind, msg).expect("result command");
            let mut bytes = Vec::with_capacity(8);
            bytes.write_u64::<LittleEndian>(value).unwrap();
            fb.tlv(kind, &bytes);
        }
    }
    fb.finish()
}

/// A pre-built result frame whose u64 payload is patched per send, so the
/// hot path never re-encodes the envelope.
#[derive(Debug, Clone)]
pub struct TxTemplate {
    frame: Vec<u8>,
    value_off: usize,
}

impl TxTemplate {
    pub fn result(kind: CmdKind) -> TxTemplate {
        let mut fb = FrameBuilder::new(kind);
        let value_off = fb.tlv(kind, &[0u8; 8]);
        TxTemplate {
            frame: fb.finish(),
            value_off,
        }
    }

    pub fn fill(&self, value: u64) -> Vec<u8> {
        let mut frame = self.frame.clone();
        LittleEndian::write_u64(&mut frame[self.value_off..self.value_off + 8], value);
        frame
    }
}

/// Parse one frame payload (the 8-byte length prefix already stripped) into
/// its messages, in command-kind order.
pub fn decode(payload: &[u8]) -> Result<Vec<Message>, ProtocolError> {
    if payload.len() < HEAD_LEN + MAP_TLV_LEN {
        return Err(ProtocolError::Truncated);
    }
    let mut rd = Reader::new(payload);
    let _flag = rd.u32()?;
    let outer = rd.u32()?;
    if outer != Tag::Win as u32 && outer != Tag::RawInput as u32 {
        return Err(ProtocolError::BadOuterTag(outer));
    }
    let declared = rd.u32()?;
    let received = (payload.len() - HEAD_LEN) as u32;
    if declared != received {
        return Err(ProtocolError::LengthMismatch { declared, received });
    }

    let area = &payload[HEAD_LEN..];
    let mut rd = Reader::new(area);
    if rd.u32()? != Tag::Map as u32 || rd.u32()? != (COMMAND_COUNT * 4) as u32 {
        return Err(ProtocolError::BadMap);
    }
    let mut map = [0u32; COMMAND_COUNT];
    for entry in map.iter_mut() {
        *entry = rd.u32()?;
    }

    let mut messages = Vec::new();
    for kind in ALL_KINDS {
        let off = map[kind as usize] as usize;
        if off == 0 {
            continue;
        }
        if off + 8 > area.len() {
            return Err(ProtocolError::Truncated);
        }
        let mut rd = Reader::new(area);
        rd.pos = off;
        let tag = rd.u32()?;
        if tag != kind.tag() as u32 {
            return Err(ProtocolError::BadTag { kind, found: tag });
        }
        let len = rd.u32()? as usize;
        let body = rd.take(len)?;
        let mut rd = Reader::new(body);
        let msg = match kind {
            CmdKind::LinkupAck => Message::LinkupAck(rd.u64()?),
            CmdKind::CreateSurface => Message::CreateSurface(decode_surface_info(&mut rd)?),
            CmdKind::CreateSurfaceAck => Message::CreateSurfaceAck(rd.u64()?),
            CmdKind::CreateView => Message::CreateView(decode_view_info(&mut rd)?),
            CmdKind::CreateViewAck => Message::CreateViewAck(rd.u64()?),
            CmdKind::CreateBo => Message::CreateBo(decode_buffer_info(&mut rd)?),
            CmdKind::CreateBoAck => Message::CreateBoAck(rd.u64()?),
            CmdKind::DestroyBo => Message::DestroyBo(rd.u64()?),
            CmdKind::DestroyBoAck => Message::DestroyBoAck(rd.u64()?),
            CmdKind::Commit => Message::Commit(decode_commit_info(&mut rd)?),
            CmdKind::CommitAck => Message::CommitAck(rd.u64()?),
            CmdKind::BoFlipped => Message::BoFlipped(rd.u64()?),
            CmdKind::BoComplete => Message::BoComplete(rd.u64()?),
            CmdKind::RawInputEvt => Message::RawInput(decode_raw_input_events(&mut rd)?),
            CmdKind::Destroy => Message::Destroy(rd.u64()?),
            CmdKind::DestroyAck => Message::DestroyAck(rd.u64()?),
            CmdKind::Shell => Message::Shell(decode_shell_info(&mut rd)?),
            CmdKind::Hpd => Message::Hpd(rd.u64()?),
        };
        messages.push(msg);
    }
    Ok(messages)
}
