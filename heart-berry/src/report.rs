//! Dice 评分的 CSV 报告.

use std::path::{Path, PathBuf};

use crate::config::Modality;
use crate::consts::label::{REPORT_HEADER, WHOLE_HEART};
use crate::error::PredictResult;
use crate::score::DiceScores;

/// 报告文件名: `{模型目录名}_test-{模态}.csv`.
pub fn report_file_name(model_dir: &Path, modality: Modality) -> String {
    let name = model_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("models");
    format!("{name}_test-{}.csv", modality.name())
}

/// 报告在输出目录下的完整路径.
#[inline]
pub fn report_path<P: AsRef<Path>>(out_dir: P, model_dir: &Path, modality: Modality) -> PathBuf {
    out_dir.as_ref().join(report_file_name(model_dir, modality))
}

/// 写出 Dice 报告. 表头固定为 8 个全心类别, 每个体数据一行.
///
/// 分数按类别值放入对应列; 真值中没有出现的类别留空.
pub fn write_dice_report<P: AsRef<Path>>(path: P, rows: &[DiceScores]) -> PredictResult<()> {
    let mut w = csv::Writer::from_path(path.as_ref())?;
    w.write_record(REPORT_HEADER)?;
    for scores in rows {
        let record: Vec<String> = scores
            .aligned(&WHOLE_HEART)
            .into_iter()
            .map(|s| s.map(|v| v.to_string()).unwrap_or_default())
            .collect();
        w.write_record(&record)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::score;
    use ndarray::Array3;

    #[test]
    fn test_report_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = report_path(dir.path(), Path::new("/models/whs_2d"), Modality::Ct);
        assert!(path.ends_with("whs_2d_test-ct.csv"));

        let truth = Array3::from_shape_vec((1, 1, 4), vec![0u16, 0, 850, 850]).unwrap();
        let pred = Array3::from_shape_vec((1, 1, 4), vec![0u16, 0, 850, 0]).unwrap();
        let rows = vec![
            score(truth.view(), truth.view()).unwrap(),
            score(pred.view(), truth.view()).unwrap(),
        ];
        write_dice_report(&path, &rows).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Bg 0,myo 205,la 420,lv 500,ra 550,rv 600,aa 820,pa 850");
        assert_eq!(lines[1], "1,,,,,,,1");

        let second: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(second.len(), 8);
        assert!(second[1..7].iter().all(|c| c.is_empty()));
        let pa: f64 = second[7].parse().unwrap();
        assert!((pa - 2.0 / 3.0).abs() < 1e-12);
    }
}
