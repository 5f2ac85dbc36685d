use crate::{page, Error, Result};

/// Validates & rounds an address-size pair to their respective page boundary.
pub(crate) fn round_to_page_boundaries(address: usize, size: usize) -> Result<(usize, usize)> {
  if size == 0 {
    return Err(Error::InvalidParameter("size"));
  }

  let size = (address % page::size()).saturating_add(size);
  let size = page::ceil(size);
  Ok((page::floor(address), size))
}

/// Validates a watch span, returning its exclusive upper bound.
pub(crate) fn checked_span(base: usize, len: usize) -> Result<usize> {
  if base == 0 {
    return Err(Error::NullAddress);
  }

  if len == 0 {
    return Err(Error::InvalidParameter("length"));
  }

  base.checked_add(len).ok_or(Error::InvalidParameter("length"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_to_page_boundaries_works() -> Result<()> {
    let pz = page::size();
    let values = &[
      ((1, pz), (0, pz * 2)),
      ((0, pz - 1), (0, pz)),
      ((0, pz + 1), (0, pz * 2)),
      ((pz - 1, 1), (0, pz)),
      ((pz + 1, pz), (pz, pz * 2)),
      ((pz, pz), (pz, pz)),
    ];

    for ((before_address, before_size), (after_address, after_size)) in values {
      let (address, size) = round_to_page_boundaries(*before_address, *before_size)?;
      assert_eq!((address, size), (*after_address, *after_size));
    }
    Ok(())
  }

  #[test]
  fn checked_span_rejects_degenerate_input() {
    assert!(matches!(checked_span(0, 1), Err(Error::NullAddress)));
    assert!(matches!(
      checked_span(1, 0),
      Err(Error::InvalidParameter("length"))
    ));
    assert!(matches!(
      checked_span(usize::MAX, 2),
      Err(Error::InvalidParameter("length"))
    ));
    assert_eq!(checked_span(0x1000, 16).unwrap(), 0x1010);
  }
}
