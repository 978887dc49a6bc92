use std::collections::BTreeSet;
use std::path::Path;

use image::{Rgb, RgbImage};

use bovw::{
    extract, extract_from_a_list, extract_pool, BowErr, ColourHistogram, DataRoot, Dataset,
    DenseSift, FeatureExtractor, Sift,
};

/// Bright discs of radius `r` on a dark background, shifted by `dx`.
fn blobs(dx: u32, r: f32) -> RgbImage {
    RgbImage::from_fn(96, 80, |x, y| {
        let (fx, fy) = (x as f32 - dx as f32, y as f32);
        let disc = |cx: f32, cy: f32, rad: f32| (fx - cx).powi(2) + (fy - cy).powi(2) < rad * rad;
        if disc(28.0, 20.0, r) || disc(60.0, 55.0, r + 3.0) {
            Rgb([225, 210, 190])
        } else if disc(62.0, 22.0, 4.0) {
            Rgb([60, 160, 220])
        } else {
            Rgb([25, 20, 30])
        }
    })
}

fn write(dir: &Path, name: &str, img: &RgbImage) -> String {
    let class_dir = dir.join(name.split('/').next().unwrap());
    std::fs::create_dir_all(class_dir).unwrap();
    img.save(dir.join(name)).unwrap();
    name.to_owned()
}

#[test]
fn sift_batch_labels_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let root = DataRoot::new(dir.path());
    let images = vec![
        write(dir.path(), "A/one.png", &blobs(0, 7.0)),
        write(dir.path(), "A/two.png", &blobs(6, 9.0)),
        write(dir.path(), "B/three.png", &blobs(3, 5.0)),
    ];
    let labels = ["A", "A", "B"];
    let sift = Sift::new(100);

    let out = extract_from_a_list(&sift, &root, &images, &labels).unwrap();

    let per_image: Vec<usize> = images
        .iter()
        .map(|f| extract_pool(&sift, &root, f).unwrap().nrows())
        .collect();
    assert!(per_image.iter().all(|n| *n > 0 && *n <= 100));
    assert_eq!(out.descriptors.nrows(), per_image.iter().sum::<usize>());
    assert_eq!(out.labels.len(), out.descriptors.nrows());
    assert_eq!(out.width(), 128);
    assert_eq!(out.count("A"), per_image[0] + per_image[1]);
    assert_eq!(out.count("B"), per_image[2]);

    let distinct: BTreeSet<&str> = out.labels.iter().map(|l| l.as_str()).collect();
    assert_eq!(distinct.into_iter().collect::<Vec<_>>(), vec!["A", "B"]);
}

#[test]
fn single_image_extract_matches_pool() {
    let dir = tempfile::tempdir().unwrap();
    let root = DataRoot::new(dir.path());
    let name = write(dir.path(), "C/img.png", &blobs(2, 8.0));
    let dense = DenseSift::default();

    let labelled = extract(&dense, &root, &name, "C").unwrap();
    let pool = extract_pool(&dense, &root, &name).unwrap();
    assert_eq!(labelled.descriptors, pool);
    assert_eq!(labelled.count("C"), pool.nrows());
    // 96 x 80 grid with step 6
    assert_eq!(pool.nrows(), 16 * 14);
}

#[test]
fn histograms_give_one_row_per_image() {
    let dir = tempfile::tempdir().unwrap();
    let root = DataRoot::new(dir.path());
    let images: Vec<String> = (0..4)
        .map(|i| write(dir.path(), &format!("D/{}.png", i), &blobs(i * 3, 6.0)))
        .collect();
    let hist = ColourHistogram::new(8);

    let out = extract_from_a_list(&hist, &root, &images, &["D"; 4]).unwrap();
    assert_eq!(out.descriptors.dim(), (4, 64));

    let again = extract_from_a_list(&hist, &root, &images, &["D"; 4]).unwrap();
    assert_eq!(out.descriptors, again.descriptors);
}

#[test]
fn dataset_split_feeds_extraction() {
    let dir = tempfile::tempdir().unwrap();
    for (i, class) in ["forest", "coast"].iter().enumerate() {
        for j in 0..2 {
            let name = format!("{}/{}.png", class, j);
            std::fs::create_dir_all(dir.path().join("train").join(class)).unwrap();
            blobs((i * 4 + j) as u32, 6.0)
                .save(dir.path().join("train").join(&name))
                .unwrap();
        }
    }
    let root = DataRoot::new(dir.path());
    let train = Dataset::read_split(&root, "train").unwrap();
    let out = extract_from_a_list(&ColourHistogram::default(), &root, &train.filenames, &train.labels)
        .unwrap();
    assert_eq!(out.labels, vec!["coast", "coast", "forest", "forest"]);
}

#[test]
fn empty_list_is_an_error() {
    let root = DataRoot::new(".");
    let none: Vec<String> = Vec::new();
    for extractor in [
        Box::new(Sift::new(100)) as Box<dyn FeatureExtractor>,
        Box::new(DenseSift::default()),
        Box::new(ColourHistogram::default()),
    ] {
        assert!(matches!(
            extract_from_a_list(&extractor, &root, &none, &none),
            Err(BowErr::EmptyBatch)
        ));
    }
}
