//! End-to-end synthesis scenarios against in-memory table fixtures.

use coronal::atomic::LineDb;
use coronal::emissivity::{EmissivityStore, StoreConfig, StoreSources};
use coronal::interrupt::Interrupt;
use coronal::model::{ComponentParams, Model};
use coronal::spectrum::EvalInfo;
use coronal::table::{Column, Extension, MemoryTable};
use coronal::units::{BOLTZ, ERG_PER_EV};
use float_cmp::assert_approx_eq;
use std::io::BufReader;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn kev(t_kelvin: f64) -> f64 {
    t_kelvin * BOLTZ / (1000.0 * ERG_PER_EV)
}

type EmisRow = (f64, f64, i64, i64, i64, i64);

/// Line-emissivity source: header, PARAMETERS, one data extension per
/// (T, ne) point.
fn line_emis_source(
    num_temps: usize,
    num_densities: usize,
    points: &[(f64, f64)],
    rows_per_point: &[Vec<EmisRow>],
) -> MemoryTable {
    let header = Extension::new("HEADER")
        .with_keyword("INUM_TEMP", i64::try_from(num_temps).unwrap())
        .with_keyword("INUM_DENSITIES", i64::try_from(num_densities).unwrap())
        .with_keyword("SABUND_SOURCE", "AG89");
    let params = Extension::new("PARAMETERS")
        .with_column(
            "kT",
            Column::Float(points.iter().map(|&(t, _)| kev(t)).collect()),
        )
        .with_column(
            "EDensity",
            Column::Float(points.iter().map(|&(_, n)| n).collect()),
        );

    let mut source = MemoryTable::new("line-emis")
        .with_extension(header)
        .with_extension(params);
    for (&(t, n), rows) in points.iter().zip(rows_per_point) {
        source.push(
            Extension::new("EMISSIVITY")
                .with_keyword("TEMPERATURE", t)
                .with_keyword("DENSITY", n)
                .with_column("Lambda", Column::Float(rows.iter().map(|r| r.0).collect()))
                .with_column("Epsilon", Column::Float(rows.iter().map(|r| r.1).collect()))
                .with_column("Element", Column::Int(rows.iter().map(|r| r.2).collect()))
                .with_column("Ion", Column::Int(rows.iter().map(|r| r.3).collect()))
                .with_column("UpperLev", Column::Int(rows.iter().map(|r| r.4).collect()))
                .with_column("LowerLev", Column::Int(rows.iter().map(|r| r.5).collect())),
        );
    }
    source
}

fn abundance_source() -> MemoryTable {
    MemoryTable::new("abund").with_extension(
        Extension::new("ABUND")
            .with_column(
                "Source",
                Column::Text(vec!["AG89".to_owned(), "LOWFE".to_owned()]),
            )
            .with_column("H", Column::Float(vec![12.0, 12.0]))
            .with_column("Fe", Column::Float(vec![7.50, 6.50])),
    )
}

fn grid(n: usize, start: f64, width: f64) -> (Vec<f64>, Vec<f64>) {
    let lo: Vec<f64> = (0..n).map(|i| width.mul_add(i as f64, start)).collect();
    let hi: Vec<f64> = lo.iter().map(|&x| x + width).collect();
    (lo, hi)
}

fn open_store(sources: StoreSources, db: &mut LineDb) -> EmissivityStore {
    EmissivityStore::open(sources, StoreConfig::default(), db, &Interrupt::new()).unwrap()
}

// S1: exact-identity lookup through the hash table.
#[test]
fn degenerate_line_lookup() {
    init_logging();
    let lines = MemoryTable::new("lines").with_extension(
        Extension::new("LINES")
            .with_keyword("ELEMENT", 26)
            .with_keyword("ION_STAT", 16)
            .with_column("Upper_Lev", Column::Int(vec![3]))
            .with_column("Lower_Lev", Column::Int(vec![1]))
            .with_column("Wavelen", Column::Float(vec![12.3456]))
            .with_column("Wave_Obs", Column::Float(vec![-1.0]))
            .with_column("Wave_Err", Column::Float(vec![0.001]))
            .with_column("Einstein_A", Column::Float(vec![1.0e12]))
            .with_column("Ein_A_err", Column::Float(vec![0.0])),
    );
    let db = LineDb::open(&[], &[&lines], &Interrupt::new()).unwrap();

    assert_eq!(db.nlines(), 1);
    assert!(db.get_line(12.3456, 26, 16, 3, 1).is_some());
    assert!(db.get_line(12.3456001, 26, 16, 3, 1).is_some());
    assert!(db.get_line(12.3456, 26, 16, 3, 2).is_none());
}

// S2: single-component delta-line spectrum.
#[test]
fn single_component_delta_line() {
    init_logging();
    let points = [(1.0e7, 1.0e10)];
    let rows = [vec![(10.0, 1.0e-14, 26, 16, 2, 1)]];
    let mut db = LineDb::open(&[], &[], &Interrupt::new()).unwrap();
    let em = open_store(
        StoreSources {
            line_emis: Some(Box::new(line_emis_source(1, 1, &points, &rows))),
            ..StoreSources::default()
        },
        &mut db,
    );

    let (lo, hi) = grid(10, 9.5, 0.1);
    let mut out = vec![0.0; 10];
    let mut model = Model::new();
    model.add_component(
        &ComponentParams {
            temperature: 1.0e7,
            density: 1.0e10,
            norm: 1.0,
            metal_abund: 1.0,
            vturb: 0.0,
            redshift: 0.0,
        },
        &[],
    );
    model
        .spectrum(&mut db, &em, &EvalInfo::new(), &lo, &hi, &mut out)
        .unwrap();

    for (i, &v) in out.iter().enumerate() {
        if i == 5 {
            assert_approx_eq!(f64, v, 1.0, epsilon = 1e-10);
        } else {
            assert_approx_eq!(f64, v, 0.0);
        }
    }
}

// S3: bilinear interpolation at the log-midpoint of four corners.
#[test]
fn bilinear_interpolation_midpoint() {
    init_logging();
    let points = [
        (1.0e6, 1.0e9),
        (1.0e6, 1.0e11),
        (1.0e8, 1.0e9),
        (1.0e8, 1.0e11),
    ];
    let line = |eps: f64| vec![(15.014, eps, 26, 16, 3, 1)];
    let rows = [line(1.0), line(2.0), line(3.0), line(4.0)];
    let mut db = LineDb::open(&[], &[], &Interrupt::new()).unwrap();
    let em = open_store(
        StoreSources {
            line_emis: Some(Box::new(line_emis_source(2, 2, &points, &rows))),
            ..StoreSources::default()
        },
        &mut db,
    );

    let spectrum = em
        .get_line_spectrum(&mut db, None, [1.0e7, 1.0e10], None)
        .unwrap();
    assert_approx_eq!(f32, spectrum.emissivity(0).unwrap(), 2.5, epsilon = 1e-6);
}

// S4: a redshifted component shifts and time-dilates.
#[test]
fn redshifted_component() {
    init_logging();
    let points = [(1.0e7, 1.0e10)];
    let rows = [vec![(10.0, 1.0e-14, 26, 16, 2, 1)]];
    let mut db = LineDb::open(&[], &[], &Interrupt::new()).unwrap();
    let em = open_store(
        StoreSources {
            line_emis: Some(Box::new(line_emis_source(1, 1, &points, &rows))),
            ..StoreSources::default()
        },
        &mut db,
    );

    let component = ComponentParams {
        temperature: 1.0e7,
        density: 1.0e10,
        norm: 1.0,
        metal_abund: 1.0,
        vturb: 0.0,
        redshift: 0.5,
    };

    // the rest-frame 10.0 Angstrom line lands at 15.0 in the lab frame
    let (lab_lo, lab_hi) = grid(10, 14.5, 0.1);
    let mut lab = vec![0.0; 10];
    let mut model = Model::new();
    model.add_component(&component, &[]);
    model
        .spectrum(&mut db, &em, &EvalInfo::new(), &lab_lo, &lab_hi, &mut lab)
        .unwrap();

    // redshift covariance: the same model at z = 0 on the grid / (1 + z),
    // scaled by 1/gamma
    let rest_lo: Vec<f64> = lab_lo.iter().map(|&x| x / 1.5).collect();
    let rest_hi: Vec<f64> = lab_hi.iter().map(|&x| x / 1.5).collect();
    let mut rest = vec![0.0; 10];
    let mut model0 = Model::new();
    model0.add_component(
        &ComponentParams {
            redshift: 0.0,
            ..component
        },
        &[],
    );
    model0
        .spectrum(&mut db, &em, &EvalInfo::new(), &rest_lo, &rest_hi, &mut rest)
        .unwrap();

    let gamma = {
        let x = 1.5_f64;
        let beta = (x * x - 1.0) / (x * x + 1.0);
        1.0 / (1.0 - beta * beta).sqrt()
    };
    for (&l, &r) in lab.iter().zip(rest.iter()) {
        assert_approx_eq!(f64, l, r / gamma, epsilon = 1e-9);
    }
    assert_approx_eq!(f64, lab[5], 1.0 / gamma, epsilon = 1e-9);
}

// S5: reinterpreting the abundance table rescales element contributions.
#[test]
fn abundance_rescaling() {
    init_logging();
    let points = [(1.0e7, 1.0e10)];
    let rows = [vec![(10.0, 1.0e-14, 26, 16, 2, 1)]];

    let run = |choose_low: bool| {
        let mut db = LineDb::open(&[], &[], &Interrupt::new()).unwrap();
        let mut em = open_store(
            StoreSources {
                line_emis: Some(Box::new(line_emis_source(1, 1, &points, &rows))),
                abundance: Some(Box::new(abundance_source())),
                ..StoreSources::default()
            },
            &mut db,
        );
        if choose_low {
            let low = em.abundances().find_by_name("LOWFE").unwrap();
            em.abundances_mut().set_chosen(low).unwrap();
        }

        let (lo, hi) = grid(10, 9.5, 0.1);
        let mut out = vec![0.0; 10];
        let mut model = Model::new();
        model.add_component(
            &ComponentParams {
                temperature: 1.0e7,
                density: 1.0e10,
                norm: 1.0,
                metal_abund: 1.0,
                vturb: 0.0,
                redshift: 0.0,
            },
            &[],
        );
        model
            .spectrum(&mut db, &em, &EvalInfo::new(), &lo, &hi, &mut out)
            .unwrap();
        out[5]
    };

    let standard = run(false);
    let rescaled = run(true);
    assert_approx_eq!(f64, standard, 1.0, epsilon = 1e-9);
    assert_approx_eq!(f64, rescaled, 0.1 * standard, epsilon = 1e-7);
}

// S6: ASCII round-trip preserves the evaluated spectrum; unknown element
// names warn but do not abort the load.
#[test]
fn model_serialization_round_trip() {
    init_logging();
    let points = [(1.0e7, 1.0e10)];
    let rows = [vec![
        (10.0, 1.0e-14, 26, 16, 2, 1),
        (10.25, 2.0e-15, 8, 7, 2, 1),
    ]];
    let mut db = LineDb::open(&[], &[], &Interrupt::new()).unwrap();
    let em = open_store(
        StoreSources {
            line_emis: Some(Box::new(line_emis_source(1, 1, &points, &rows))),
            ..StoreSources::default()
        },
        &mut db,
    );

    let mut model = Model::new();
    for (norm, metal) in [(1.0, 1.0), (0.5, 0.25), (2.0, 1.0)] {
        model.add_component(
            &ComponentParams {
                temperature: 1.0e7,
                density: 1.0e10,
                norm,
                metal_abund: metal,
                vturb: 0.0,
                redshift: 0.0,
            },
            &[(26, 0.5)],
        );
    }

    let mut text = Vec::new();
    model.write_ascii(&mut text).unwrap();
    // an unknown element name must not prevent loading
    text.extend_from_slice(b"  Qq=0.7\n");
    let mut read = Model::from_reader(BufReader::new(text.as_slice())).unwrap();
    assert_eq!(read.len(), 3);

    let (lo, hi) = grid(10, 9.5, 0.1);
    let mut out_a = vec![0.0; 10];
    model
        .spectrum(&mut db, &em, &EvalInfo::new(), &lo, &hi, &mut out_a)
        .unwrap();
    let mut out_b = vec![0.0; 10];
    read.spectrum(&mut db, &em, &EvalInfo::new(), &lo, &hi, &mut out_b)
        .unwrap();

    for (&a, &b) in out_a.iter().zip(out_b.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
