//! 类型擦除的一维数值数组, 带可选的 padding (缺失值) 语义.
//!
//! 所有读取接口都返回 `Option<f64>`: padding 或 NaN 读出为 `None`,
//! 缺失值不会被悄悄当作 0 传播.

use std::fmt;

/// 数组元素的标量类型.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScalarType {
    /// `i8`
    I8,
    /// `u8`
    U8,
    /// `i16`
    I16,
    /// `u16`
    U16,
    /// `i32`
    I32,
    /// `u32`
    U32,
    /// `f32`
    F32,
    /// `f64`
    F64,
}

impl ScalarType {
    /// 全部类型.
    pub const ALL: [ScalarType; 8] = [
        Self::I8,
        Self::U8,
        Self::I16,
        Self::U16,
        Self::I32,
        Self::U32,
        Self::F32,
        Self::F64,
    ];

    /// 单个元素的字节数.
    #[inline]
    pub const fn size_of(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// 是否为浮点类型?
    #[inline]
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// 将 `v` 转换为该类型能精确表示的值 (整数四舍五入并饱和).
    pub fn normalize(&self, v: f64) -> f64 {
        match self {
            Self::I8 => <i8 as Scalar>::from_f64(v).to_f64(),
            Self::U8 => <u8 as Scalar>::from_f64(v).to_f64(),
            Self::I16 => <i16 as Scalar>::from_f64(v).to_f64(),
            Self::U16 => <u16 as Scalar>::from_f64(v).to_f64(),
            Self::I32 => <i32 as Scalar>::from_f64(v).to_f64(),
            Self::U32 => <u32 as Scalar>::from_f64(v).to_f64(),
            Self::F32 => <f32 as Scalar>::from_f64(v).to_f64(),
            Self::F64 => v,
        }
    }

    /// 整数类型默认的 padding 值 (有符号取最小值, 无符号取最大值). 浮点类型以 NaN 表示缺失, 返回 `None`.
    pub fn default_padding(&self) -> Option<f64> {
        match self {
            Self::I8 => Some(i8::MIN as f64),
            Self::U8 => Some(u8::MAX as f64),
            Self::I16 => Some(i16::MIN as f64),
            Self::U16 => Some(u16::MAX as f64),
            Self::I32 => Some(i32::MIN as f64),
            Self::U32 => Some(u32::MAX as f64),
            Self::F32 | Self::F64 => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// 可存入 [`TypedArray`] 的标量.
pub trait Scalar: Copy + Default + PartialOrd + Send + Sync + 'static {
    /// 对应的类型标签.
    const TYPE: ScalarType;

    /// 由 `f64` 转换. 整数类型四舍五入并饱和, NaN 变为 0.
    fn from_f64(v: f64) -> Self;

    /// 转换为 `f64`. 对所有支持的类型都是精确的.
    fn to_f64(self) -> f64;

    /// 包装为类型擦除的存储.
    fn wrap(v: Vec<Self>) -> ArrayData;

    /// 若存储恰为该类型, 借出切片.
    fn view(data: &ArrayData) -> Option<&[Self]>;
}

/// 各标量类型的底层存储.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArrayData {
    /// `i8`
    I8(Vec<i8>),
    /// `u8`
    U8(Vec<u8>),
    /// `i16`
    I16(Vec<i16>),
    /// `u16`
    U16(Vec<u16>),
    /// `i32`
    I32(Vec<i32>),
    /// `u32`
    U32(Vec<u32>),
    /// `f32`
    F32(Vec<f32>),
    /// `f64`
    F64(Vec<f64>),
}

macro_rules! impl_int_scalar {
    ($($t: ty => $tag: ident),+ $(,)?) => {
        $(
            impl Scalar for $t {
                const TYPE: ScalarType = ScalarType::$tag;

                #[inline]
                fn from_f64(v: f64) -> Self {
                    if v.is_nan() {
                        return 0;
                    }
                    num::clamp(v.round(), <$t>::MIN as f64, <$t>::MAX as f64) as $t
                }

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn wrap(v: Vec<Self>) -> ArrayData {
                    ArrayData::$tag(v)
                }

                #[inline]
                fn view(data: &ArrayData) -> Option<&[Self]> {
                    match data {
                        ArrayData::$tag(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )+
    };
}

macro_rules! impl_float_scalar {
    ($($t: ty => $tag: ident),+ $(,)?) => {
        $(
            impl Scalar for $t {
                const TYPE: ScalarType = ScalarType::$tag;

                #[inline]
                fn from_f64(v: f64) -> Self {
                    v as $t
                }

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn wrap(v: Vec<Self>) -> ArrayData {
                    ArrayData::$tag(v)
                }

                #[inline]
                fn view(data: &ArrayData) -> Option<&[Self]> {
                    match data {
                        ArrayData::$tag(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )+
    };
}

impl_int_scalar!(i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32);
impl_float_scalar!(f32 => F32, f64 => F64);

/// 对 `ArrayData` 的每个分支执行同一段泛型代码.
macro_rules! dispatch {
    ($data: expr, $v: ident => $body: expr) => {
        match $data {
            ArrayData::I8($v) => $body,
            ArrayData::U8($v) => $body,
            ArrayData::I16($v) => $body,
            ArrayData::U16($v) => $body,
            ArrayData::I32($v) => $body,
            ArrayData::U32($v) => $body,
            ArrayData::F32($v) => $body,
            ArrayData::F64($v) => $body,
        }
    };
}

/// 同时对两份存储分派. 类型不同时返回 `false`.
macro_rules! dispatch_pair {
    ($a: expr, $b: expr, ($x: ident, $y: ident) => $body: expr) => {
        match ($a, $b) {
            (ArrayData::I8($x), ArrayData::I8($y)) => { $body; true }
            (ArrayData::U8($x), ArrayData::U8($y)) => { $body; true }
            (ArrayData::I16($x), ArrayData::I16($y)) => { $body; true }
            (ArrayData::U16($x), ArrayData::U16($y)) => { $body; true }
            (ArrayData::I32($x), ArrayData::I32($y)) => { $body; true }
            (ArrayData::U32($x), ArrayData::U32($y)) => { $body; true }
            (ArrayData::F32($x), ArrayData::F32($y)) => { $body; true }
            (ArrayData::F64($x), ArrayData::F64($y)) => { $body; true }
            _ => false,
        }
    };
}

impl ArrayData {
    fn zeros(ty: ScalarType, len: usize) -> Self {
        match ty {
            ScalarType::I8 => Self::I8(vec![0; len]),
            ScalarType::U8 => Self::U8(vec![0; len]),
            ScalarType::I16 => Self::I16(vec![0; len]),
            ScalarType::U16 => Self::U16(vec![0; len]),
            ScalarType::I32 => Self::I32(vec![0; len]),
            ScalarType::U32 => Self::U32(vec![0; len]),
            ScalarType::F32 => Self::F32(vec![0.0; len]),
            ScalarType::F64 => Self::F64(vec![0.0; len]),
        }
    }

    fn scalar_type(&self) -> ScalarType {
        match self {
            Self::I8(_) => ScalarType::I8,
            Self::U8(_) => ScalarType::U8,
            Self::I16(_) => ScalarType::I16,
            Self::U16(_) => ScalarType::U16,
            Self::I32(_) => ScalarType::I32,
            Self::U32(_) => ScalarType::U32,
            Self::F32(_) => ScalarType::F32,
            Self::F64(_) => ScalarType::F64,
        }
    }
}

/// 单一标量类型的扁平数组, 附带可选 padding 值.
///
/// padding 值总是以该类型能精确表示的形式保存.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TypedArray {
    data: ArrayData,
    padding: Option<f64>,
}

impl TypedArray {
    /// 创建长度为 `len` 的零值数组, 无 padding.
    pub fn new(ty: ScalarType, len: usize) -> Self {
        Self {
            data: ArrayData::zeros(ty, len),
            padding: None,
        }
    }

    /// 由已有数据创建.
    pub fn from_vec<T: Scalar>(v: Vec<T>) -> Self {
        Self {
            data: T::wrap(v),
            padding: None,
        }
    }

    /// 设置 padding 值, 返回自身.
    pub fn with_padding(mut self, padding: Option<f64>) -> Self {
        self.set_padding_value(padding);
        self
    }

    /// 元素个数.
    #[inline]
    pub fn len(&self) -> usize {
        dispatch!(&self.data, v => v.len())
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 标量类型.
    #[inline]
    pub fn scalar_type(&self) -> ScalarType {
        self.data.scalar_type()
    }

    /// 底层存储.
    #[inline]
    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    /// 若元素类型为 `T`, 借出底层切片.
    #[inline]
    pub fn as_slice<T: Scalar>(&self) -> Option<&[T]> {
        T::view(&self.data)
    }

    /// 当前 padding 值.
    #[inline]
    pub fn padding(&self) -> Option<f64> {
        self.padding
    }

    /// 设置 (或清除) padding 值.
    pub fn set_padding_value(&mut self, padding: Option<f64>) {
        let ty = self.scalar_type();
        self.padding = padding.filter(|p| !p.is_nan()).map(|p| ty.normalize(p));
    }

    /// 读取第 `i` 个元素. padding 或 NaN 返回 `None`.
    ///
    /// # Panics
    ///
    /// `i` 越界时 panic.
    #[inline]
    pub fn get(&self, i: usize) -> Option<f64> {
        let x = dispatch!(&self.data, v => v[i].to_f64());
        if x.is_nan() || self.padding == Some(x) {
            None
        } else {
            Some(x)
        }
    }

    /// 读取第 `i` 个元素, 缺失时返回 `fill`.
    #[inline]
    pub fn get_or(&self, i: usize, fill: f64) -> f64 {
        self.get(i).unwrap_or(fill)
    }

    /// 第 `i` 个元素是否缺失?
    #[inline]
    pub fn is_padding_at(&self, i: usize) -> bool {
        self.get(i).is_none()
    }

    /// 写入第 `i` 个元素. 整数类型四舍五入并饱和.
    ///
    /// # Panics
    ///
    /// `i` 越界时 panic.
    #[inline]
    pub fn set(&mut self, i: usize, value: f64) {
        dispatch!(&mut self.data, v => v[i] = Scalar::from_f64(value))
    }

    /// 将第 `i` 个元素标记为缺失.
    ///
    /// 整数数组若尚无 padding 值, 则采用 [`ScalarType::default_padding`].
    pub fn set_padding_at(&mut self, i: usize) {
        let pad = self.ensure_padding();
        self.set(i, pad);
    }

    /// 用 `value` 填充全部元素.
    pub fn fill(&mut self, value: f64) {
        let len = self.len();
        self.fill_range(value, 0, len);
    }

    /// 用 `value` 填充 `[from, to)`.
    pub fn fill_range(&mut self, value: f64, from: usize, to: usize) {
        dispatch!(&mut self.data, v => {
            let x = Scalar::from_f64(value);
            v[from..to].iter_mut().for_each(|e| *e = x);
        })
    }

    /// 将 `[from, to)` 全部标记为缺失.
    pub fn fill_padding_range(&mut self, from: usize, to: usize) {
        let pad = self.ensure_padding();
        self.fill_range(pad, from, to);
    }

    fn ensure_padding(&mut self) -> f64 {
        match self.padding {
            Some(p) => p,
            None => match self.scalar_type().default_padding() {
                Some(p) => {
                    self.padding = Some(p);
                    p
                }
                None => f64::NAN,
            },
        }
    }

    /// 原地反转 `[from, from + len)`.
    pub fn block_reverse(&mut self, from: usize, len: usize) {
        dispatch!(&mut self.data, v => v[from..from + len].reverse())
    }

    /// 交换两个不重叠的块 `[a, a + len)` 和 `[b, b + len)`.
    ///
    /// # Panics
    ///
    /// 两块重叠时 panic.
    pub fn block_swap(&mut self, a: usize, b: usize, len: usize) {
        if a == b || len == 0 {
            return;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(lo + len <= hi, "overlapping blocks");
        dispatch!(&mut self.data, v => {
            let (head, tail) = v.split_at_mut(hi);
            head[lo..lo + len].swap_with_slice(&mut tail[..len]);
        })
    }

    /// 将 `self[from..from + len]` 复制到 `dst[to..to + len]`.
    ///
    /// 类型相同时按原始值复制 (padding 值原样搬运); 否则逐元素转换, 缺失值写为 `dst` 的 padding.
    pub fn block_copy_to(&self, dst: &mut TypedArray, to: usize, from: usize, len: usize) {
        let same_padding = self.padding == dst.padding;
        if same_padding {
            let copied = dispatch_pair!(&self.data, &mut dst.data, (s, d) => {
                d[to..to + len].copy_from_slice(&s[from..from + len])
            });
            if copied {
                return;
            }
        }
        for k in 0..len {
            match self.get(from + k) {
                Some(x) => dst.set(to + k, x),
                None => dst.set_padding_at(to + k),
            }
        }
    }

    /// 同类型, 同 padding, 长度为 `len` 的零值数组.
    pub fn new_template(&self, len: usize) -> Self {
        Self {
            data: ArrayData::zeros(self.scalar_type(), len),
            padding: self.padding,
        }
    }

    /// 转换为另一类型. 缺失值在新数组中仍为缺失.
    pub fn convert(&self, ty: ScalarType) -> Self {
        let len = self.len();
        let mut out = Self::new(ty, len);
        out.set_padding_value(self.padding);
        for i in 0..len {
            match self.get(i) {
                Some(x) => out.set(i, x),
                None => out.set_padding_at(i),
            }
        }
        out
    }

    /// 有效值的最小值与最大值. 无有效值时返回 `None`.
    pub fn range(&self) -> Option<(f64, f64)> {
        (0..self.len())
            .filter_map(|i| self.get(i))
            .fold(None, |acc, x| match acc {
                None => Some((x, x)),
                Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
            })
    }

    /// 有效值个数.
    pub fn valid_count(&self) -> usize {
        (0..self.len()).filter(|&i| self.get(i).is_some()).count()
    }

    /// 转换为 `f64` 向量, 缺失值写为 `fill`.
    pub fn to_f64_vec(&self, fill: f64) -> Vec<f64> {
        (0..self.len()).map(|i| self.get_or(i, fill)).collect()
    }

    /// 转换为 `f32` 向量, 缺失值写为 `fill`.
    pub fn to_f32_vec(&self, fill: f32) -> Vec<f32> {
        (0..self.len())
            .map(|i| self.get(i).map_or(fill, |x| x as f32))
            .collect()
    }

    /// 在 `[lo, hi]` 上以 `bins` 个等宽区间统计有效值直方图.
    pub fn histogram(&self, bins: usize, (lo, hi): (f64, f64)) -> Vec<usize> {
        let mut h = vec![0; bins];
        if bins == 0 {
            return h;
        }
        let width = (hi - lo) / bins as f64;
        for x in (0..self.len()).filter_map(|i| self.get(i)) {
            if x < lo || x > hi {
                continue;
            }
            let b = if width > 0.0 {
                (((x - lo) / width) as usize).min(bins - 1)
            } else {
                0
            };
            h[b] += 1;
        }
        h
    }
}
