use image::imageops::FilterType;
use image::RgbImage;
use std::fmt;
use std::str::FromStr;

const HASH_SIDE: u32 = 8;

/// 64-bit average hash of a card's art.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtHash(u64);

impl ArtHash {
    /// Grayscale, shrink to 8x8, then one bit per cell: set when the cell is
    /// brighter than the mean. Bits are packed row-major, most significant first.
    pub fn compute(image: &RgbImage) -> Option<Self> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }

        let gray = image::imageops::grayscale(image);
        let small = image::imageops::resize(&gray, HASH_SIDE, HASH_SIDE, FilterType::Triangle);

        let total: u32 = small.pixels().map(|p| p.0[0] as u32).sum();
        let mean = total as f32 / (HASH_SIDE * HASH_SIDE) as f32;

        let bits = small
            .pixels()
            .fold(0u64, |acc, p| (acc << 1) | u64::from(p.0[0] as f32 > mean));
        Some(Self(bits))
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn distance(&self, other: &ArtHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for ArtHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ArtHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Self)
    }
}

/// Closest entry by Hamming distance; ties keep the earliest entry.
pub fn nearest<'a, T>(
    target: &ArtHash,
    entries: impl IntoIterator<Item = &'a (ArtHash, T)>,
) -> Option<(&'a T, u32)>
where
    T: 'a,
{
    let mut best: Option<(&'a T, u32)> = None;
    for (hash, value) in entries {
        let distance = target.distance(hash);
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((value, distance));
        }
    }
    best
}
