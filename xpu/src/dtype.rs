use core::fmt::Display;

/// Element type of a tensor.
///
/// Block quantized types store `block_size` logical elements in `type_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
    F64,
    I8,
    I16,
    I32,
    I64,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Q8K,
    IQ4NL,
    IQ4XS,
}

impl Display for DType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Q4_0 => "q4_0",
            DType::Q4_1 => "q4_1",
            DType::Q5_0 => "q5_0",
            DType::Q5_1 => "q5_1",
            DType::Q8_0 => "q8_0",
            DType::Q8_1 => "q8_1",
            DType::Q2K => "q2_K",
            DType::Q3K => "q3_K",
            DType::Q4K => "q4_K",
            DType::Q5K => "q5_K",
            DType::Q6K => "q6_K",
            DType::Q8K => "q8_K",
            DType::IQ4NL => "iq4_nl",
            DType::IQ4XS => "iq4_xs",
        })
    }
}

impl DType {
    /// Number of logical elements stored in one block
    pub const fn block_size(self) -> usize {
        match self {
            DType::F32
            | DType::F16
            | DType::BF16
            | DType::F64
            | DType::I8
            | DType::I16
            | DType::I32
            | DType::I64 => 1,
            DType::Q4_0
            | DType::Q4_1
            | DType::Q5_0
            | DType::Q5_1
            | DType::Q8_0
            | DType::Q8_1
            | DType::IQ4NL => 32,
            DType::Q2K
            | DType::Q3K
            | DType::Q4K
            | DType::Q5K
            | DType::Q6K
            | DType::Q8K
            | DType::IQ4XS => 256,
        }
    }

    /// Bytes taken by one block
    pub const fn type_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::BF16 => 2,
            DType::F64 => 8,
            DType::I8 => 1,
            DType::I16 => 2,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::Q4_0 => 18,
            DType::Q4_1 => 20,
            DType::Q5_0 => 22,
            DType::Q5_1 => 24,
            DType::Q8_0 => 34,
            DType::Q8_1 => 36,
            DType::Q2K => 84,
            DType::Q3K => 110,
            DType::Q4K => 144,
            DType::Q5K => 176,
            DType::Q6K => 210,
            DType::Q8K => 292,
            DType::IQ4NL => 18,
            DType::IQ4XS => 136,
        }
    }

    pub const fn is_quantized(self) -> bool {
        self.block_size() > 1
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16 | DType::F64)
    }

    /// Importance quantized types, these need whole blocks of the second operand in mul_mat
    pub const fn is_iq(self) -> bool {
        matches!(self, DType::IQ4NL | DType::IQ4XS)
    }

    /// Bytes taken by `ne` elements laid out in a single row.
    pub fn row_size(self, ne: i64) -> usize {
        debug_assert!(ne >= 0);
        debug_assert_eq!(ne as usize % self.block_size(), 0, "row of {ne} {self} is not whole blocks");
        self.type_size() * ne as usize / self.block_size()
    }
}

#[cfg(test)]
mod tests {
    use super::DType;

    #[test]
    fn row_sizes() {
        assert_eq!(DType::F32.row_size(10), 40);
        assert_eq!(DType::F16.row_size(512), 1024);
        assert_eq!(DType::Q4_0.row_size(64), 36);
        assert_eq!(DType::Q6K.row_size(512), 420);
        assert!(DType::Q8_0.is_quantized());
        assert!(!DType::BF16.is_quantized());
    }
}
