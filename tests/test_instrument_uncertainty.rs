use approx::assert_relative_eq;
use chrono::{Duration, TimeZone, Utc};
use hydrorad::core::uncertainty::{
    GridStats, CHANNEL_CORRELATION_KEY, INPUT_CORRELATION_KEY,
};
use hydrorad::{
    ChannelSet, ClassCoefficients, CorrelationStore, CosineCharacterization, InstrumentProcessor,
    ProcessingConfig, SensorCharacterization, SensorRecord, SensorType, SolarGeometry,
    SpectralSeries, Spectrum,
};
use ndarray::{arr1, Array2};

const NBAND: usize = 6;

fn wavelengths() -> Spectrum {
    (0..NBAND).map(|i| 400.0 + 20.0 * i as f64).collect()
}

fn config() -> ProcessingConfig {
    ProcessingConfig {
        interp_interval: 10.0,
        mc_draws: 80,
        parallel_degree: 1,
        seed: Some(7),
    }
}

fn record(sensor: SensorType, level: f64, scans: usize) -> SensorRecord {
    let counts = SpectralSeries::from_shape_fn((scans, NBAND), |(i, j)| {
        (level + (i as f64 % 3.0) * 0.4 + j as f64 * 2.0) / 65535.0
    });
    SensorRecord {
        sensor,
        timestamps: (0..scans as i64)
            .map(|i| Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(i))
            .collect(),
        counts,
        wavelengths: wavelengths(),
        integration_time: 128.0,
    }
}

fn records() -> ChannelSet<(SensorRecord, SensorRecord)> {
    ChannelSet {
        es: (record(SensorType::Es, 1200.0, 6), record(SensorType::Es, 110.0, 6)),
        li: (record(SensorType::Li, 900.0, 6), record(SensorType::Li, 95.0, 6)),
        lt: (record(SensorType::Lt, 1000.0, 6), record(SensorType::Lt, 100.0, 6)),
    }
}

fn characterization(sensor: SensorType) -> SensorCharacterization {
    let mut lsf = Array2::from_diag(&Spectrum::ones(NBAND));
    for i in 0..NBAND - 1 {
        lsf[[i, i + 1]] = 0.02;
        lsf[[i + 1, i]] = 0.02;
    }
    SensorCharacterization {
        sensor,
        wavelengths: wavelengths(),
        cal_coefficient: Spectrum::ones(NBAND),
        b0: Spectrum::from_elem(NBAND, 0.001),
        b1: Spectrum::from_elem(NBAND, 0.0005),
        s1: Spectrum::from_elem(NBAND, 0.50),
        s1_unc: Spectrum::from_elem(NBAND, 0.002),
        s2: Spectrum::from_elem(NBAND, 0.51),
        s2_unc: Spectrum::from_elem(NBAND, 0.002),
        t1: 1.0,
        t2: 2.0,
        reference_time: 256.0,
        lsf,
        lsf_unc: Array2::from_elem((NBAND, NBAND), 1e-4),
        thermal: Spectrum::from_elem(NBAND, 1.002),
        thermal_unc: Spectrum::from_elem(NBAND, 0.001),
        lamp: Spectrum::from_elem(NBAND, 2.0),
        lamp_unc: Spectrum::from_elem(NBAND, 0.01),
        panel: match sensor {
            SensorType::Es => None,
            _ => Some(Spectrum::from_elem(NBAND, 0.5)),
        },
        panel_unc: match sensor {
            SensorType::Es => None,
            _ => Some(Spectrum::from_elem(NBAND, 0.002)),
        },
        cosine: match sensor {
            SensorType::Es => Some(CosineCharacterization {
                zenith_angles: arr1(&[0.0, 30.0, 60.0]),
                zenith_error: Array2::from_elem((NBAND, 3), 1.5),
                zenith_error_unc: Array2::from_elem((NBAND, 3), 0.1),
            }),
            _ => None,
        },
    }
}

fn characterizations() -> ChannelSet<SensorCharacterization> {
    ChannelSet {
        es: characterization(SensorType::Es),
        li: characterization(SensorType::Li),
        lt: characterization(SensorType::Lt),
    }
}

fn geometry() -> SolarGeometry {
    SolarGeometry {
        solar_zenith: 42.0,
        direct_ratio: Spectrum::from_elem(NBAND, 0.7),
    }
}

#[test]
fn test_full_characterization_produces_relative_uncertainties() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut processor = InstrumentProcessor::new(config(), CorrelationStore::in_memory());

    let result = processor
        .full_characterization(&records(), &characterizations(), &geometry())
        .expect("full characterization failed");

    let nbands = result.wavebands.len();
    assert!(nbands > 0);
    for (sensor, channel) in result.channels.iter() {
        assert_eq!(channel.calibrated.len(), nbands, "{sensor} calibrated");
        assert_eq!(channel.uncertainty.len(), nbands, "{sensor} uncertainty");
        assert_eq!(channel.samples.ncols(), nbands, "{sensor} samples");
        assert_eq!(channel.samples.nrows(), 80, "{sensor} draws");
        assert!(
            channel.uncertainty.iter().all(|u| u.is_finite() && *u > 0.0),
            "{sensor} relative uncertainty must be positive"
        );
        // the synthetic perturbations are all at the percent level
        assert!(
            channel.uncertainty.iter().all(|u| *u < 0.5),
            "{sensor} relative uncertainty implausibly large"
        );
    }

    // inter-channel correlation: symmetric, unit diagonal
    let corr = &result.correlation;
    assert_eq!(corr.dim(), (3, 3));
    for i in 0..3 {
        assert_relative_eq!(corr[[i, i]], 1.0);
        for j in 0..3 {
            assert_relative_eq!(corr[[i, j]], corr[[j, i]], epsilon = 1e-12);
            assert!(corr[[i, j]].abs() <= 1.0 + 1e-9);
        }
    }

    // the processed correlation is persisted for downstream stages
    assert!(processor.store().get(CHANNEL_CORRELATION_KEY).is_some());
}

#[test]
fn test_full_characterization_grid_is_shared_and_within_range() {
    let mut processor = InstrumentProcessor::new(config(), CorrelationStore::in_memory());
    let result = processor
        .full_characterization(&records(), &characterizations(), &geometry())
        .expect("full characterization failed");

    let wl = wavelengths();
    let first = result.wavebands[0];
    let last = result.wavebands[result.wavebands.len() - 1];
    assert!(first >= wl[0]);
    assert!(last <= wl[wl.len() - 1]);
    for pair in result.wavebands.to_vec().windows(2) {
        assert_relative_eq!(pair[1] - pair[0], 10.0, epsilon = 1e-9);
    }
}

fn grid_stats(level: f64, nband: usize) -> GridStats {
    GridStats {
        ave_light: Spectrum::from_elem(nband, level),
        ave_dark: Spectrum::from_elem(nband, level / 10.0),
        std_light: Spectrum::from_elem(nband, level / 100.0),
        std_dark: Spectrum::from_elem(nband, level / 1000.0),
        std_signal: Spectrum::from_elem(nband, 0.01),
    }
}

fn class_coefficients(nband: usize) -> ClassCoefficients {
    ClassCoefficients {
        cal: Spectrum::from_elem(nband, 1.5),
        cal_unc: Spectrum::from_elem(nband, 0.015),
        stability_unc: Spectrum::from_elem(nband, 0.005),
        linearity_unc: Spectrum::from_elem(nband, 0.003),
        straylight_unc: Spectrum::from_elem(nband, 0.002),
        thermal_unc: Spectrum::from_elem(nband, 0.004),
        angular_unc: Spectrum::from_elem(nband, 0.006),
    }
}

#[test]
fn test_class_based_requires_input_correlation() {
    let mut processor = InstrumentProcessor::new(config(), CorrelationStore::in_memory());
    let grid: Spectrum = arr1(&[400.0, 410.0, 420.0]);
    let stats = ChannelSet {
        es: grid_stats(120.0, 3),
        li: grid_stats(90.0, 3),
        lt: grid_stats(100.0, 3),
    };
    let coeffs = ChannelSet {
        es: class_coefficients(3),
        li: class_coefficients(3),
        lt: class_coefficients(3),
    };
    assert!(processor.class_based(&grid, &stats, &coeffs).is_err());
}

#[test]
fn test_class_based_propagation_with_stored_correlation() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut store = CorrelationStore::in_memory();
    store.insert(INPUT_CORRELATION_KEY, Array2::eye(24));
    let mut processor = InstrumentProcessor::new(config(), store);

    let grid: Spectrum = arr1(&[400.0, 410.0, 420.0, 430.0]);
    let stats = ChannelSet {
        es: grid_stats(120.0, 4),
        li: grid_stats(90.0, 4),
        lt: grid_stats(100.0, 4),
    };
    let coeffs = ChannelSet {
        es: class_coefficients(4),
        li: class_coefficients(4),
        lt: class_coefficients(4),
    };

    let result = processor
        .class_based(&grid, &stats, &coeffs)
        .expect("class-based propagation failed");

    for (sensor, channel) in result.channels.iter() {
        assert_eq!(channel.absolute.len(), 4, "{sensor}");
        assert!(channel.absolute.iter().all(|u| *u > 0.0));
        assert!(channel.relative.iter().all(|u| u.is_finite() && *u > 0.0));
        // percent-level inputs give percent-level outputs
        assert!(channel.relative.iter().all(|u| *u < 0.2), "{sensor}");
    }
    assert_eq!(result.correlation.dim(), (3, 3));
    assert!(processor.store().get(CHANNEL_CORRELATION_KEY).is_some());
}

#[test]
fn test_channel_stats_and_grid_pipeline() {
    let processor = InstrumentProcessor::new(config(), CorrelationStore::in_memory());
    let cal = ChannelSet {
        es: Spectrum::ones(NBAND),
        li: Spectrum::ones(NBAND),
        lt: Spectrum::ones(NBAND),
    };
    let stats = processor
        .channel_stats(&records(), &cal)
        .expect("channel statistics failed");
    let grid = processor.waveband_grid(&stats).expect("grid failed");
    assert!(grid.len() > 1);

    let es_grid = processor
        .stats_to_grid(&stats.es, grid.view())
        .expect("stats resampling failed");
    assert_eq!(es_grid.ave_light.len(), grid.len());
    assert!(es_grid.std_signal.iter().all(|v| v.is_finite()));
}

#[test]
fn test_correlation_store_survives_processing_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("correlation_mats.csv");

    {
        let mut store = CorrelationStore::open(&path).unwrap();
        store.insert(INPUT_CORRELATION_KEY, Array2::eye(24));
        store.save().unwrap();
    }

    let store = CorrelationStore::open(&path).unwrap();
    let mut processor = InstrumentProcessor::new(config(), store);
    let result = processor
        .full_characterization(&records(), &characterizations(), &geometry())
        .expect("full characterization failed");
    assert_eq!(result.correlation.dim(), (3, 3));

    // the channel correlation of this run is now on disk for the next one
    let reloaded = CorrelationStore::open(&path).unwrap();
    let persisted = reloaded.get(CHANNEL_CORRELATION_KEY).expect("not persisted");
    assert_eq!(persisted.dim(), (3, 3));
    assert_relative_eq!(persisted[[0, 0]], 1.0);
}
