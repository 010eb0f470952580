//! A read benchmark that measures sequential file-read speed through the
//! suite's `Suite::read` over a RAM disk, at a few file sizes.

extern crate criterion;

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, PlotConfiguration, AxisScale,
    criterion_group, criterion_main,
};

use embedfs::api::Suite;
use embedfs::config::SuiteConfig;
use embedfs::device::RamStorage;
use embedfs::storage::{DeviceConfig, StorageAsDriver};

use typenum::consts::U512;

const FILES: &[(&'static str, usize)] = &[
    ("/1k", 1024),
    ("/100k", 100 * 1024),
    ("/1M", 1024 * 1024),
];

fn make_suite_with_files() -> (Suite, embedfs::volume::VolumeId) {
    let mut suite = Suite::new(SuiteConfig::default()).unwrap();
    let driver = StorageAsDriver::new("ram", 512, true, || RamStorage::<U512>::new(1 << 16, 512));
    let device_id = suite.register_driver(Box::new(driver)).unwrap();
    suite.device_open(device_id, DeviceConfig::default()).unwrap();
    let volume = suite.fmt(device_id, 0, 8).unwrap();

    for (path, size) in FILES.iter() {
        let h = suite.open(volume, path, true, false, 0).unwrap();
        let chunk = vec![0xABu8; 4096];
        let mut written = 0usize;
        while written < *size {
            let n = (*size - written).min(chunk.len());
            suite.write(h, &chunk[..n]).unwrap();
            written += n;
        }
        suite.close(h, 0).unwrap();
    }

    (suite, volume)
}

fn bench_read_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("read speed");

    let plot_config = PlotConfiguration::default().summary_scale(AxisScale::Logarithmic);
    group.plot_config(plot_config);

    let (mut suite, volume) = make_suite_with_files();

    for (path, size) in FILES.iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("file read speed", size), path, |b, path| {
            b.iter_batched(
                || suite.open(volume, path, false, true, 0).unwrap(),
                |h| {
                    let mut buf = [0u8; 4096];
                    let mut checksum: u64 = 0;
                    loop {
                        let n = suite.read(h, &mut buf).unwrap();
                        if n == 0 {
                            break;
                        }
                        checksum = checksum.wrapping_add(buf[..n].iter().map(|&b| b as u64).sum::<u64>());
                    }
                    suite.close(h, 0).unwrap();
                    if checksum % 56789 == 6 {
                        println!("{}", checksum & 7);
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, bench_read_speed);

fn main() {
    std::thread::Builder::new()
        .stack_size(1024 * 1024 * 1024)
        .spawn(|| {
            benches();

            Criterion::default().configure_from_args().final_summary();
        })
        .unwrap()
        .join()
        .unwrap();
}
