use datafusion::physical_plan::metrics::{
    BaselineMetrics, Count, ExecutionPlanMetricsSet, MetricBuilder, Time,
};

pub struct ShuffleWriterMetrics {
    /// metrics
    pub baseline: BaselineMetrics,

    /// Time to compute partition ids and scatter rows into partition buffers
    pub repart_time: Time,

    /// Time encoding partition batches to the block wire format
    pub encode_time: Time,

    /// Time spent writing to spill files and the output sink
    pub write_time: Time,

    /// Number of input batches
    pub input_batches: Count,

    /// count of spills during the execution of the writer
    pub spill_count: Count,

    /// total spilled bytes during the execution of the writer
    pub spilled_bytes: Count,

    /// The original size of written data. Different to `spilled_bytes` because of compression.
    pub data_size: Count,
}

impl ShuffleWriterMetrics {
    pub fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            baseline: BaselineMetrics::new(metrics, partition),
            repart_time: MetricBuilder::new(metrics).subset_time("repart_time", partition),
            encode_time: MetricBuilder::new(metrics).subset_time("encode_time", partition),
            write_time: MetricBuilder::new(metrics).subset_time("write_time", partition),
            input_batches: MetricBuilder::new(metrics).counter("input_batches", partition),
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            spilled_bytes: MetricBuilder::new(metrics).spilled_bytes(partition),
            data_size: MetricBuilder::new(metrics).counter("data_size", partition),
        }
    }
}
