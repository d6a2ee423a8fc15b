fn main() {
    tunnelw::run();
}
