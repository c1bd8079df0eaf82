//! 预测工具依赖的通用组件.

pub mod loader;

const SEP: &str = "--------------------------------------------------------";

/// 在标准输出打印简单分隔线.
#[inline]
pub fn sep() {
    // 标准输出已关闭时没有可以补救的.
    let _ = sep_to(std::io::stdout().lock());
}

/// 向 `w` 写入简单分隔线.
#[inline]
pub fn sep_to<W: std::io::Write>(mut w: W) -> std::io::Result<()> {
    writeln!(&mut w, "{SEP}")
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sep_to() {
        let mut buf = Vec::new();
        sep_to(&mut buf).unwrap();
        assert_eq!(buf.len(), SEP.len() + 1);
        assert!(cpus() >= 1);
    }
}
