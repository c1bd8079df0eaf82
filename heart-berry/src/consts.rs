//! 通用常量.

/// 全心分割 (whole heart segmentation) 的临床标签值.
pub mod label {
    /// 背景.
    pub const BACKGROUND: u16 = 0;

    /// 左心室心肌 (myocardium).
    pub const MYO: u16 = 205;

    /// 左心房 (left atrium).
    pub const LA: u16 = 420;

    /// 左心房的遗留重复编码. 载入真值时总是折叠为 [`LA`].
    pub const LA_LEGACY: u16 = 421;

    /// 左心室 (left ventricle).
    pub const LV: u16 = 500;

    /// 右心房 (right atrium).
    pub const RA: u16 = 550;

    /// 右心室 (right ventricle).
    pub const RV: u16 = 600;

    /// 升主动脉 (ascending aorta).
    pub const AA: u16 = 820;

    /// 肺动脉 (pulmonary artery).
    pub const PA: u16 = 850;

    /// 按升序排列的全部临床标签. 下标即网络内部类别编号.
    pub const WHOLE_HEART: [u16; 8] = [BACKGROUND, MYO, LA, LV, RA, RV, AA, PA];

    /// Dice 报告表头, 与 [`WHOLE_HEART`] 一一对应.
    pub const REPORT_HEADER: [&str; 8] = [
        "Bg 0", "myo 205", "la 420", "lv 500", "ra 550", "rv 600", "aa 820", "pa 850",
    ];
}

/// 网络输出类别数.
pub const NUM_CLASSES: usize = 8;

/// 送入 2D 网络的切片边长.
pub const CANONICAL_SIZE: usize = 256;

/// 默认的推理分批个数. 整卷一次推理容易爆显存.
pub const DEFAULT_PARTITIONS: usize = 2;

/// CT 强度截断窗口 `[-750, 750]` 的半宽.
pub const CT_HALF_WINDOW: f32 = 750.0;

/// MR 强度截断使用的 (下, 上) 百分位.
pub const MR_PERCENTILES: (f64, f64) = (20.0, 99.0);

/// 视图名称, 下标即视图对应的数组轴.
pub const VIEW_NAMES: [&str; 3] = ["axial", "coronal", "sagittal"];
