use std::path::PathBuf;

use bovw::*;

fn main() {
    pretty_env_logger::init();

    // Load existing vocabulary
    let voc = Vocabulary::<3>::load("vocabs/test.voc").unwrap();
    println!("Vocabulary: {:#?}", voc);

    // Create BoW vectors from the test data. Save file name for demonstration.
    let root = DataRoot::default();
    let test = Dataset::read_split(&root, "test").unwrap();
    let sift = Sift::new(100);
    let mut bows: Vec<(&PathBuf, &str, BoW)> = Vec::new();
    for (file, label) in test.filenames.iter().zip(test.labels.iter()).step_by(40).take(8) {
        let desc = extract_pool(&sift, &root, file).unwrap();
        bows.push((file, label.as_str(), voc.transform(desc.view()).unwrap()));
    }

    // Match every image to every other image
    for (f1, label1, bow1) in bows.iter() {
        let mut scores: Vec<(f32, &PathBuf, &str)> = Vec::new();
        for (f2, label2, bow2) in bows.iter() {
            scores.push((bow1.l1(bow2), *f2, *label2));
        }

        // Print out the top 5 matches for each image
        println!("\nTop 5 Matches for {:?} ({}):", f1, label1);
        println!("Match      |      Label      |      Score");
        scores.sort_by(|a, b| b.0.total_cmp(&a.0));
        for m in scores.iter().take(5) {
            println!("{:?} | {} | {:.4}", m.1, m.2, m.0);
        }
    }
}
