//! The offline-learned transition model.
//! 离线学习得到的状态转移模型。
//!
//! The table maps a discretized (delay-acceleration, window-acceleration,
//! delay-trend) triple to a probability distribution over next-window buckets.
//! It is loaded once at startup and never mutated afterwards.
//!
//! Layout: with `W` window buckets and `D` delay buckets the matrix has `W·D`
//! rows of `W·D` columns. Row `W·a + b` holds the distributions observed after
//! delay-acceleration bucket `a` and window-acceleration bucket `b`; inside a
//! row, the columns `[W·c, W·(c+1))` are the distribution for delay-trend
//! bucket `c`.

use crate::error::{Error, Result};
use std::{fs, path::Path, str::FromStr};
use tracing::{debug, trace};

/// The window value returned when no row of the table yields a selection.
/// 当表中没有任何一行产生选择时返回的窗口值。
pub const FLOOR_WINDOW: f64 = 1.0;

/// One discretized axis of the table.
///
/// 模型表的一个离散化坐标轴。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Axis {
    /// Number of buckets along the axis.
    pub buckets: usize,
    pub min: i64,
    pub max: i64,
    pub step: i64,
}

impl Axis {
    /// Maps a continuous value onto a bucket index. Values outside
    /// `[min, max]` land in the first or last bucket.
    ///
    /// 将连续值映射到桶索引。超出 `[min, max]` 的值落入首个或最后一个桶。
    pub fn bucket(&self, value: f64) -> usize {
        let last = self.buckets.saturating_sub(1);
        if value.is_nan() || value < self.min as f64 || self.step <= 0 {
            return 0;
        }
        let idx = if value > self.max as f64 {
            self.max.saturating_sub(self.min) / self.step
        } else {
            ((value - self.min as f64) / self.step as f64) as i64
        };
        (idx.max(0) as usize).min(last)
    }

    /// The continuous value a bucket stands for.
    ///
    /// 桶所代表的连续值。
    pub fn value_of(&self, bucket: usize) -> f64 {
        i64::try_from(bucket)
            .unwrap_or(i64::MAX)
            .saturating_mul(self.step)
            .saturating_add(self.min) as f64
    }

    /// Checks that every bucket value is representable.
    fn validate(&self, name: &str) -> Result<()> {
        if self.buckets == 0 {
            return Err(Error::model(1, format!("{name} axis has no buckets")));
        }
        if self.step <= 0 {
            return Err(Error::model(1, format!("{name} step must be positive")));
        }
        if self.max < self.min {
            return Err(Error::model(1, format!("{name} maximum is below its minimum")));
        }
        if self.max.checked_sub(self.min).is_none() {
            return Err(Error::model(1, format!("{name} range overflows")));
        }
        let top = i64::try_from(self.buckets - 1)
            .ok()
            .and_then(|last| last.checked_mul(self.step))
            .and_then(|offset| offset.checked_add(self.min));
        if top.is_none() {
            return Err(Error::model(
                1,
                format!("{name} axis of {} buckets overflows", self.buckets),
            ));
        }
        Ok(())
    }
}

/// The three trend signals after bucketization.
///
/// 离散化之后的三个趋势信号。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendBuckets {
    pub delay_accel: usize,
    pub window_accel: usize,
    pub delay_trend: usize,
}

/// Where the stochastic walk stopped.
///
/// 随机游走停止的位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub row: usize,
    pub bucket: usize,
}

/// The immutable transition table.
///
/// 不可变的状态转移表。
#[derive(Debug, Clone)]
pub struct ModelTable {
    window: Axis,
    delay: Axis,
    rows: Vec<Vec<f64>>,
}

impl ModelTable {
    /// Builds a table from its axes and rows, checking the matrix shape.
    ///
    /// 根据坐标轴和行构建模型表，并检查矩阵形状。
    pub fn new(window: Axis, delay: Axis, rows: Vec<Vec<f64>>) -> Result<Self> {
        window.validate("window")?;
        delay.validate("delay")?;

        let width = window
            .buckets
            .checked_mul(delay.buckets)
            .ok_or_else(|| Error::model(1, "table dimensions overflow"))?;
        if rows.len() != width {
            return Err(Error::model(
                rows.len() + 1,
                format!("expected {width} probability rows, found {}", rows.len()),
            ));
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(Error::model(
                    i + 2,
                    format!("expected {width} probabilities, found {}", row.len()),
                ));
            }
            if let Some(p) = row.iter().find(|p| !p.is_finite() || **p < 0.0) {
                return Err(Error::model(i + 2, format!("invalid probability {p}")));
            }
        }

        Ok(Self { window, delay, rows })
    }

    /// Parses the comma-separated text form. The first line is the header
    /// `W, min_w, max_w, step_w, D, min_d, max_d, step_d`; each following line
    /// is one row of the flattened matrix. Blank lines are ignored.
    ///
    /// 解析逗号分隔的文本格式。
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        let (header_line, header) = lines
            .next()
            .ok_or_else(|| Error::model(0, "the table is empty"))?;
        let fields = split_fields(header);
        if fields.len() != 8 {
            return Err(Error::model(
                header_line,
                format!("header needs 8 fields, found {}", fields.len()),
            ));
        }
        let mut values = [0i64; 8];
        for (slot, field) in values.iter_mut().zip(&fields) {
            *slot = field.parse().map_err(|_| {
                Error::model(header_line, format!("header field {field:?} is not an integer"))
            })?;
        }
        let count = |v: i64| -> Result<usize> {
            usize::try_from(v)
                .map_err(|_| Error::model(header_line, format!("bucket count {v} is negative")))
        };
        let window = Axis {
            buckets: count(values[0])?,
            min: values[1],
            max: values[2],
            step: values[3],
        };
        let delay = Axis {
            buckets: count(values[4])?,
            min: values[5],
            max: values[6],
            step: values[7],
        };

        let mut rows = Vec::new();
        for (line_no, line) in lines {
            let row = split_fields(line)
                .into_iter()
                .map(|field| {
                    field.parse::<f64>().map_err(|_| {
                        Error::model(line_no, format!("{field:?} is not a probability"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }

        let table = Self::new(window, delay, rows)?;
        debug!(
            window_buckets = window.buckets,
            delay_buckets = delay.buckets,
            min_delay = delay.min,
            max_delay = delay.max,
            min_window = window.min,
            max_window = window.max,
            "Model table loaded"
        );
        Ok(table)
    }

    /// Reads and parses a table file.
    ///
    /// 读取并解析模型表文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::model(0, format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn window_axis(&self) -> Axis {
        self.window
    }

    pub fn delay_axis(&self) -> Axis {
        self.delay
    }

    /// Lower threshold of the delay trend; below it the rule-based increase applies.
    pub fn min_delay(&self) -> f64 {
        self.delay.min as f64
    }

    /// Upper threshold of the delay trend; above it the rule-based decrease applies.
    pub fn max_delay(&self) -> f64 {
        self.delay.max as f64
    }

    /// Bucketizes the three trend values, clamped to the table bounds.
    ///
    /// 将三个趋势值离散化，并限制在表的范围内。
    pub fn bucketize(&self, delay_accel: f64, window_accel: f64, delay_trend: f64) -> TrendBuckets {
        TrendBuckets {
            delay_accel: self.delay.bucket(delay_accel),
            window_accel: self.window.bucket(window_accel),
            delay_trend: self.delay.bucket(delay_trend),
        }
    }

    /// Walks the table from row `W·a + b` down to row 0. Each row's slice for
    /// the delay-trend bucket is sorted ascending and its probabilities are
    /// added to a running sum; the first bucket that lifts the sum above
    /// `draw` is selected. The sum carries over from one row to the next.
    ///
    /// 从第 `W·a + b` 行向下遍历到第 0 行，返回第一个使累积概率超过 `draw` 的桶。
    pub fn select(&self, buckets: TrendBuckets, draw: f64) -> Option<Selection> {
        let width = self.window.buckets;
        let start = width * buckets.delay_trend.min(self.delay.buckets - 1);
        let first_row = width
            .saturating_mul(buckets.delay_accel)
            .saturating_add(buckets.window_accel)
            .min(self.rows.len() - 1);

        let mut cdf = 0.0;
        let mut candidates: Vec<(usize, f64)> = Vec::with_capacity(width);
        for row in (0..=first_row).rev() {
            candidates.clear();
            candidates.extend(
                self.rows[row][start..start + width]
                    .iter()
                    .copied()
                    .enumerate(),
            );
            candidates.sort_by(|x, y| x.1.total_cmp(&y.1));

            for &(bucket, p) in &candidates {
                cdf += p;
                if draw < cdf {
                    trace!(row, bucket, draw, cdf, "Model walk selected bucket");
                    return Some(Selection { row, bucket });
                }
            }
        }
        None
    }

    /// Converts a window bucket into a continuous window, relative to the
    /// previous window.
    ///
    /// 将窗口桶转换为相对于上一窗口的连续窗口值。
    pub fn window_for(&self, bucket: usize, prev_window: f64) -> f64 {
        let scale = if prev_window > 1.0 {
            prev_window.log10()
        } else {
            (prev_window + 1.0).log10()
        };
        (self.window.value_of(bucket) / scale + 100.0) * prev_window / 100.0
    }

    /// The model-driven next window, or [`FLOOR_WINDOW`] when the walk
    /// exhausts every row.
    ///
    /// 模型驱动的下一个窗口值；若遍历完所有行仍无选择，则返回 [`FLOOR_WINDOW`]。
    pub fn next_window(&self, buckets: TrendBuckets, prev_window: f64, draw: f64) -> f64 {
        match self.select(buckets, draw) {
            Some(selection) => self.window_for(selection.bucket, prev_window),
            None => {
                debug!(?buckets, draw, "Model walk exhausted every row");
                FLOOR_WINDOW
            }
        }
    }
}

impl FromStr for ModelTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn split_fields(line: &str) -> Vec<&str> {
    line.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .collect()
}
