use std::{io::Write, path::Path};

use tokio::{
    fs::File,
    io::{self, AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, SeekFrom},
};

/// Moves backwards in a file to beginning of a previous line.
/// Useful when the last line has to be inspected or cut off.
pub async fn seek_line_backwards(
    file: &mut (impl AsyncSeek + AsyncWrite + AsyncRead + Unpin),
    buffer: &mut [u8],
) -> Result<(), io::Error> {
    // The byte right before the cursor is skipped so that a line terminator we are standing on
    // doesn't count as the previous line's end. For example: need_to_read_this\nwe_are_here_now\n
    let mut need_to_skip = 1usize;
    loop {
        let leftover = file.stream_position().await?;
        if leftover == 0 {
            return Ok(());
        }
        let next_chunk = u64::min(leftover, buffer.len() as u64) as usize;
        file.seek(SeekFrom::Current(-(next_chunk as i64))).await?;

        file.read_exact(&mut buffer[..next_chunk]).await?;
        let iter = buffer[..next_chunk].iter().rev().enumerate();
        let iter = iter.skip(need_to_skip);
        for (index, value) in iter {
            if *value == b'\n' {
                file.seek(SeekFrom::Current(-(index as i64))).await?;
                return Ok(());
            }
        }

        need_to_skip = need_to_skip.saturating_sub(1);
        file.seek(SeekFrom::Current(-(next_chunk as i64))).await?;
    }
}

/// A line-oriented file whose last byte isn't a newline ends with the remains of an interrupted
/// write. Cuts that remainder off and leaves the cursor at the new end of the file.
///
/// Returns the amount of bytes removed.
pub async fn truncate_torn_tail(file: &mut File) -> Result<u64, io::Error> {
    let len = file.seek(SeekFrom::End(0)).await?;
    if len == 0 {
        return Ok(0);
    }

    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(0);
    }

    seek_line_backwards(file, &mut [0u8; 1024]).await?;
    let keep = file.stream_position().await?;
    file.set_len(keep).await?;
    file.seek(SeekFrom::Start(keep)).await?;
    Ok(len - keep)
}

/// Write bytes to a file atomically: write to a temp file in the same directory, then rename over
/// the target. Readers see either the old or the new content, never a mix.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::Result;

    use tempfile::{tempdir, tempfile};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};

    use crate::fs::operations::{atomic_write, seek_line_backwards, truncate_torn_tail};

    const CONTENT: &str = "first line\n\
                           second line\n\
                           third";

    #[tokio::test]
    async fn test_seek_line_backwards_reaches_start() -> Result<()> {
        let mut file = tempfile()?;
        file.write_all(CONTENT.as_bytes())?;

        let mut file = tokio::fs::File::from_std(file);

        for _ in 0..3 {
            seek_line_backwards(&mut file, vec![0; 1024].as_mut_slice()).await?;
        }

        assert_eq!(file.stream_position().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_seek_line_backwards_small_buffer() -> Result<()> {
        let mut file = tempfile()?;
        file.write_all(CONTENT.as_bytes())?;

        let first_newline = CONTENT.find('\n').unwrap() as u64 + 1;

        let mut file = BufReader::new(tokio::fs::File::from_std(file));
        file.seek(std::io::SeekFrom::Start(0)).await?;
        file.read_line(&mut String::new()).await?;
        file.read_line(&mut String::new()).await?;

        seek_line_backwards(&mut file, vec![0; 2].as_mut_slice()).await?;
        assert_eq!(file.stream_position().await?, first_newline);

        seek_line_backwards(&mut file, vec![0; 2].as_mut_slice()).await?;
        assert_eq!(file.stream_position().await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_truncate_torn_tail() -> Result<()> {
        let mut file = tempfile()?;
        file.write_all(CONTENT.as_bytes())?;
        let mut file = tokio::fs::File::from_std(file);

        let removed = truncate_torn_tail(&mut file).await?;
        assert_eq!(removed, "third".len() as u64);

        file.rewind().await?;
        let mut s = String::new();
        file.read_to_string(&mut s).await?;
        assert_eq!(s, "first line\nsecond line\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_truncate_torn_tail_keeps_complete_lines() -> Result<()> {
        let mut file = tempfile()?;
        file.write_all(b"complete\n")?;
        let mut file = tokio::fs::File::from_std(file);

        assert_eq!(truncate_torn_tail(&mut file).await?, 0);
        assert_eq!(file.stream_position().await?, "complete\n".len() as u64);

        let mut empty = tokio::fs::File::from_std(tempfile()?);
        assert_eq!(truncate_torn_tail(&mut empty).await?, 0);
        Ok(())
    }

    #[test]
    fn test_atomic_write_replaces_content() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("state.json");
        atomic_write(&path, b"old")?;
        atomic_write(&path, b"new")?;
        assert_eq!(std::fs::read_to_string(&path)?, "new");
        Ok(())
    }
}
