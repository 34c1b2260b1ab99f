use std::{collections::VecDeque, fmt};

use bytes::Bytes;

use crate::{
    error::{PipeError, Result},
    segment::Segment,
};

/// 读端段链上的逻辑位置。
///
/// 位置携带所属读端的标识与流内绝对偏移，`advance_to` 据此拒绝来自其它读端、
/// 或早于当前读头的位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SequencePosition {
    owner: u64,
    offset: u64,
}

impl SequencePosition {
    pub(crate) fn new(owner: u64, offset: u64) -> Self {
        Self { owner, offset }
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    /// 自读端创建以来的绝对字节偏移。
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// 借用读端段链的逻辑字节区间 `[start, end)`。
///
/// # 设计背景（Why）
/// - 读端把源数据拉进多个池化段；应用看到的是一段连续的逻辑字节序列，
///   底层可能跨越多个段，这里按需逐段暴露而不做拼接拷贝。
/// - 借用关系保证序列存活期间读端无法 `advance_to` 或 `complete`，
///   段被归还之前不可能仍有切片指向它。
///
/// # 契约说明（What）
/// - `chunks()` 按流顺序返回各段中落在区间内的非空切片；
/// - `start()`/`end()`/`position_at()` 产生的位置可交给 `advance_to`；
/// - `slice(from, to)` 要求两个位置都属于本序列且 `from <= to`。
#[derive(Clone, Copy)]
pub struct ReadSequence<'a> {
    chain: &'a VecDeque<Segment>,
    owner: u64,
    start: u64,
    end: u64,
}

impl<'a> ReadSequence<'a> {
    pub(crate) fn new(chain: &'a VecDeque<Segment>, owner: u64, start: u64, end: u64) -> Self {
        Self {
            chain,
            owner,
            start,
            end,
        }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 区间是否只落在一个段内。
    pub fn is_single_segment(&self) -> bool {
        self.chunks().nth(1).is_none()
    }

    /// 第一个非空切片；空序列返回空切片。
    pub fn first(&self) -> &'a [u8] {
        self.chunks().next().unwrap_or(&[])
    }

    /// 按流顺序遍历各段落在区间内的字节。
    pub fn chunks(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let (chain, start, end) = (self.chain, self.start, self.end);
        chain.iter().filter_map(move |segment| {
            let seg_start = segment.running_index();
            let seg_end = seg_start + segment.len() as u64;
            let from = seg_start.max(start);
            let to = seg_end.min(end);
            if from >= to {
                return None;
            }
            let bytes = segment.bytes();
            Some(&bytes[(from - seg_start) as usize..(to - seg_start) as usize])
        })
    }

    pub fn start(&self) -> SequencePosition {
        SequencePosition::new(self.owner, self.start)
    }

    pub fn end(&self) -> SequencePosition {
        SequencePosition::new(self.owner, self.end)
    }

    /// 距序列起点 `index` 字节处的位置，`index` 可以等于 `len()`。
    pub fn position_at(&self, index: usize) -> Result<SequencePosition> {
        let len = self.len();
        if index > len {
            return Err(PipeError::OutOfRange {
                requested: index,
                available: len,
            });
        }
        Ok(SequencePosition::new(self.owner, self.start + index as u64))
    }

    /// 截取 `[from, to)` 子序列。
    pub fn slice(&self, from: SequencePosition, to: SequencePosition) -> Result<ReadSequence<'a>> {
        if from.owner != self.owner || to.owner != self.owner {
            return Err(PipeError::invalid_state(
                "position belongs to another reader",
            ));
        }
        if from.offset < self.start || to.offset > self.end || from.offset > to.offset {
            return Err(PipeError::OutOfRange {
                requested: to.offset.saturating_sub(from.offset) as usize,
                available: self.len(),
            });
        }
        Ok(ReadSequence::new(self.chain, self.owner, from.offset, to.offset))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// 拷贝为独立的 `Bytes`，可在读端 `advance_to` 之后继续持有。
    pub fn copy_to_bytes(&self) -> Bytes {
        Bytes::from(self.to_vec())
    }
}

impl fmt::Debug for ReadSequence<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSequence")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("chunks", &self.chunks().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_buffer::{BlockPool, SlabBlockPool};

    fn chain_of(pool: &SlabBlockPool, parts: &[&[u8]]) -> VecDeque<Segment> {
        let mut chain = VecDeque::new();
        let mut running = 0u64;
        for part in parts {
            let mut segment = Segment::default();
            segment.assign(pool.rent(part.len()).expect("租借失败"), running);
            segment.writable_mut()[..part.len()].copy_from_slice(part);
            segment.append(part.len()).expect("追加失败");
            running += part.len() as u64;
            chain.push_back(segment);
        }
        chain
    }

    #[test]
    fn chunks_follow_chain_order() {
        let pool = SlabBlockPool::new();
        let chain = chain_of(&pool, &[b"Hello ", b"pooled ", b"World"]);
        let sequence = ReadSequence::new(&chain, 1, 0, 18);
        assert_eq!(sequence.len(), 18);
        assert!(!sequence.is_single_segment());
        assert_eq!(sequence.first(), b"Hello ");
        assert_eq!(sequence.to_vec(), b"Hello pooled World");
        assert_eq!(&sequence.copy_to_bytes()[..], b"Hello pooled World");
    }

    #[test]
    fn slice_crosses_segment_boundary() {
        let pool = SlabBlockPool::new();
        let chain = chain_of(&pool, &[b"abc", b"def", b"ghi"]);
        let sequence = ReadSequence::new(&chain, 9, 0, 9);
        let from = sequence.position_at(2).expect("位置合法");
        let to = sequence.position_at(7).expect("位置合法");
        let middle = sequence.slice(from, to).expect("切片合法");
        assert_eq!(middle.to_vec(), b"cdefg");
        assert_eq!(middle.chunks().count(), 3);
        assert_eq!(middle.start().offset(), 2);

        assert!(sequence.position_at(10).is_err());
        let foreign = SequencePosition::new(8, 1);
        assert_eq!(
            sequence.slice(foreign, to).expect_err("跨读端位置必须拒绝").code(),
            "spark.pipe.invalid_state"
        );
        assert!(sequence.slice(to, from).is_err());
    }
}
