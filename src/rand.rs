/// Returns true with probability `pct` percent (0..=100).
pub fn chance(pct_of_100: u8) -> bool {
    fastrand::u8(0..100) < pct_of_100
}
