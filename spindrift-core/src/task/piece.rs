//! Piece geometry: the fixed-size slices a task's content is transferred
//! and verified in.

use super::{PeerId, TaskId};

/// Content length of a task that has not been measured yet.
pub const UNKNOWN_CONTENT_LENGTH: i64 = -1;

/// Piece count of a task that is still streaming from its first source.
pub const UNKNOWN_TOTAL_PIECES: i32 = -1;

/// Sentinel piece number carried by the final result of a task.
pub const END_PIECE_NUM: i32 = -1;

const MIB: u64 = 1024 * 1024;
const DEFAULT_PIECE_SIZE: u32 = 4 * MIB as u32;
const PIECE_SIZE_LIMIT: u32 = 15 * MIB as u32;

/// On-wire framing style of a piece body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PieceStyle {
    /// Raw bytes, no transformation.
    #[default]
    Plain,
}

/// Description of one piece of a task.
///
/// Pieces are contiguous, non-overlapping and cover the whole content; the
/// concatenation of all pieces in order equals the origin bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceInfo {
    /// Zero-based piece number.
    pub num: u32,
    /// Byte offset of the piece within the content.
    pub range_start: u64,
    /// Length of the piece in bytes.
    pub range_size: u32,
    /// Lowercase hex MD5 of the piece bytes.
    pub md5: String,
    /// Body framing style.
    pub style: PieceStyle,
}

/// Reply of a peer's piece metadata endpoint.
#[derive(Debug, Clone, Default)]
pub struct PiecePacket {
    /// Peer that produced the packet.
    pub dst_peer: Option<PeerId>,
    /// Zero or more newly advertised pieces. Empty means "nothing new yet".
    pub piece_infos: Vec<PieceInfo>,
    /// Total piece count, or [`UNKNOWN_TOTAL_PIECES`] while the remote end
    /// is itself still streaming.
    pub total_pieces: i32,
    /// Content length, or [`UNKNOWN_CONTENT_LENGTH`].
    pub content_length: i64,
    /// Aggregate digest over all piece MD5s, once the remote end knows it.
    pub piece_md5_sign: Option<String>,
}

/// Request against a peer's piece metadata endpoint.
#[derive(Debug, Clone)]
pub struct PieceTaskRequest {
    /// Task to enumerate pieces of.
    pub task_id: TaskId,
    /// First piece number the caller has no metadata for.
    pub start_num: u32,
    /// Upper bound on returned pieces.
    pub limit: u32,
}

/// Derives the piece size for a task of the given content length.
///
/// Small content uses the 4 MiB default. Beyond 200 MiB the size grows by
/// one MiB per 100 MiB of content so the piece count stays manageable,
/// clamped to 15 MiB.
pub fn compute_piece_size(content_length: i64) -> u32 {
    if content_length <= 200 * MIB as i64 {
        return DEFAULT_PIECE_SIZE;
    }
    let gap_count = (content_length as u64 / (100 * MIB)) as u32;
    let size = DEFAULT_PIECE_SIZE + (gap_count - 2) * MIB as u32;
    size.min(PIECE_SIZE_LIMIT)
}

/// Number of pieces covering `content_length` bytes at `piece_size`.
pub fn total_piece_count(content_length: u64, piece_size: u32) -> u32 {
    if content_length == 0 {
        return 0;
    }
    content_length.div_ceil(piece_size as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_size_defaults_for_small_content() {
        assert_eq!(compute_piece_size(0), DEFAULT_PIECE_SIZE);
        assert_eq!(compute_piece_size(10 * MIB as i64), DEFAULT_PIECE_SIZE);
        assert_eq!(compute_piece_size(200 * MIB as i64), DEFAULT_PIECE_SIZE);
    }

    #[test]
    fn piece_size_scales_with_large_content() {
        // 300 MiB -> 3 gaps -> 4 MiB + 1 MiB
        assert_eq!(compute_piece_size(300 * MIB as i64), 5 * MIB as u32);
        // 1 GiB -> 10 gaps -> 4 MiB + 8 MiB
        assert_eq!(compute_piece_size(1024 * MIB as i64), 12 * MIB as u32);
    }

    #[test]
    fn piece_size_clamps_at_limit() {
        assert_eq!(compute_piece_size(100 * 1024 * MIB as i64), PIECE_SIZE_LIMIT);
    }

    #[test]
    fn piece_count_rounds_up() {
        assert_eq!(total_piece_count(0, 1024), 0);
        assert_eq!(total_piece_count(1, 1024), 1);
        assert_eq!(total_piece_count(1024, 1024), 1);
        assert_eq!(total_piece_count(1025, 1024), 2);
        assert_eq!(total_piece_count(10240, 1024), 10);
    }
}
