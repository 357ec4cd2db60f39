use super::{ContentPart, Message};

const SYSTEM_INSTRUCTION: &str = "You are an experienced front-end developer. Your goal is to implement a landing page using tailwindcss as close as possible to the one provided by the designer. The designer is not a native English speaker and has made some spelling mistakes that you need to fix to make the text correct and consistent with the page's content and value proposition. You should output HTML in a single block of code that contains the <body> code of the site (never use <head>, <link>, or <style> elements). Use a pleasing, Apple-inspired aesthetic. Use CSS best practices, such as grids, and always make sure that text contrasts well with its background. Always make sure the site has 4 sections and do some nice copywriting. Tailwind is already included. Make sure to implement something that is responsive for all screen sizes. You can use images but always from this website: https://enzostvs-cached-generation.hf.space/generate/{image prompt}?format={square or portrait-9_16 or landscape-16_9} - also add the prompt used in the <img> alt attribute. You should never use svg.";

const COMPARISON_INSTRUCTION: &str = "Here are two images: the first is the original design and the second is a screenshot of your current implementation. List the differences, then improve your implementation to make it closer to the original design. Don't change the images that are the same as the original design, and improve the areas that are not the same as the original design.";

const POLISH_INSTRUCTION: &str = "This is the last pass: also review all visible copy for spelling, grammar, and consistency with the page's value proposition, and fix anything that reads poorly.";

/// Fixed task framing. Always the first message of every context sent to
/// the model.
pub fn system_message() -> Message {
    Message::system(SYSTEM_INSTRUCTION)
}

/// Second message of every context: the reference design plus the short
/// implement instruction.
pub fn initial_user_message(design_url: &str) -> Message {
    Message::user_parts(vec![
        ContentPart::image(design_url),
        ContentPart::text("Implement this design"),
    ])
}

/// Per-round critique prompt. Part order is a contract the model depends
/// on: instruction text, then the original design, then the current
/// rendering. `polish` extends the text for a final copy-quality pass.
pub fn comparison_message(design_url: &str, screenshot_url: &str, polish: bool) -> Message {
    let text = if polish {
        format!("{COMPARISON_INSTRUCTION} {POLISH_INSTRUCTION}")
    } else {
        COMPARISON_INSTRUCTION.to_string()
    };
    Message::user_parts(vec![
        ContentPart::text(text),
        ContentPart::image(design_url),
        ContentPart::image(screenshot_url),
    ])
}
