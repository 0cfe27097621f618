// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::default::Default;
use std::fs;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

fn read_json<P: AsRef<Path>>(path: P) -> Result<(String, String)> {
    let mut f = fs::OpenOptions::new().read(true).open(path)?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;

    let mut preamble = String::new();
    let mut body = String::new();
    let mut seen_body = false;

    for line in buf.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") || trimmed.starts_with("#") {
            if !seen_body {
                preamble = preamble + line + "\n";
            }
            body = body + "\n";
        } else {
            seen_body = true;
            body = body + line + "\n"
        }
    }
    Ok((preamble, body))
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (_, body) = read_json(path)?;
        Ok(serde_json::from_str::<Self>(&body)?)
    }
}

pub trait JsonSave
where
    Self: Default + Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with("\n") {
            serialized += "\n";
        }
        match Self::preamble() {
            Some(pre) => Ok(pre + &serialized),
            None => Ok(serialized),
        }
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        f.write_all(self.as_json()?.as_ref())?;
        Ok(())
    }
}

/// Report file written through a staging file so readers never observe
/// a half-written report.
#[derive(Debug)]
pub struct JsonReportFile<T: JsonSave> {
    pub path: PathBuf,
    pub staging: PathBuf,
    pub data: T,
}

impl<T: JsonSave> JsonReportFile<T> {
    pub fn new<P: AsRef<Path>>(path_in: P) -> Self {
        let path = PathBuf::from(path_in.as_ref());
        let mut staging = path.clone().into_os_string();
        staging.push(".staging");

        Self {
            path,
            staging: PathBuf::from(staging),
            data: Default::default(),
        }
    }

    pub fn commit(&self) -> Result<()> {
        self.data.save(&self.staging)?;
        fs::rename(&self.staging, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Default, Serialize, Deserialize, PartialEq, Debug)]
    struct TestRep {
        name: String,
        count: u32,
    }

    impl JsonLoad for TestRep {}
    impl JsonSave for TestRep {
        fn preamble() -> Option<String> {
            Some("// test report\n".to_string())
        }
    }

    #[test]
    fn test_preamble_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.json");

        let mut rep = JsonReportFile::<TestRep>::new(&path);
        rep.data = TestRep {
            name: "x".into(),
            count: 3,
        };
        rep.commit().unwrap();

        let loaded = TestRep::load(&path).unwrap();
        assert_eq!(loaded, rep.data);
        assert!(!path.with_extension("json.staging").exists());
    }
}
