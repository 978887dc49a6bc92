use bovw::{extract_from_a_list, DataRoot, Dataset, Sift, Vocabulary};

fn main() {
    pretty_env_logger::init();

    // Extract sift descriptors from at most 30 training images per class
    let root = DataRoot::default();
    let train = Dataset::read_split(&root, "train").unwrap();
    let features = extract_from_a_list(&Sift::new(100), &root, &train.filenames, &train.labels).unwrap();
    println!("Detected {} SIFT features.", features.len());

    // Create vocabulary from features
    let voc = Vocabulary::<3>::create(features.descriptors.view(), 9).unwrap();
    println!("\nVocabulary = {:#?}", voc);

    // Save vocab and load it again just for fun
    std::fs::create_dir_all("vocabs").unwrap();
    voc.save("vocabs/test.voc").unwrap();
    let loaded_voc = Vocabulary::<3>::load("vocabs/test.voc").unwrap();

    // Make sure save & load worked
    assert_eq!(voc, loaded_voc);
}
